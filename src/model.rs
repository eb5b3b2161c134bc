// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ranker model envelope.
//!
//! The loader itself treats model bytes as opaque. This module provides a
//! concrete on-disk format for callers that don't bring their own: a JSON
//! envelope carrying the scoring payload plus the metadata needed to decide
//! whether a cached copy can still be trusted.
//!
//! ```json
//! {
//!   "metadata": {
//!     "source": "https://example.com/models/translate.model",
//!     "last_modified": "2025-01-15T10:00:00Z",
//!     "cache_duration_secs": 86400,
//!     "sha256": "9f86d08..."
//!   },
//!   "payload": "0a1b2c..."
//! }
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::loader::{ModelRejection, Validator};

/// Freshness and provenance for a [`RankerModel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// URL the model was published at, if known.
    #[serde(default)]
    pub source: Option<String>,
    /// When the model was produced.
    pub last_modified: DateTime<Utc>,
    /// How long after `last_modified` the model stays valid. Zero never expires.
    #[serde(default)]
    pub cache_duration_secs: u64,
    /// Hex SHA-256 of the decoded payload.
    pub sha256: String,
}

/// A scoring payload with its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankerModel {
    pub metadata: ModelMetadata,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

impl RankerModel {
    /// Wrap `payload`, stamping it with the current time and its checksum.
    pub fn new(payload: Vec<u8>, source: Option<&Url>, cache_duration_secs: u64) -> Self {
        Self {
            metadata: ModelMetadata {
                source: source.map(|u| u.to_string()),
                last_modified: Utc::now(),
                cache_duration_secs,
                sha256: checksum(&payload),
            },
            payload,
        }
    }

    /// Parse an envelope without checking it.
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, ModelRejection> {
        serde_json::from_slice(bytes).map_err(|e| ModelRejection::Parse(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("Failed to serialize ranker model")
    }

    /// When the model stops being fresh, or `None` if it never does.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.metadata.cache_duration_secs == 0 {
            return None;
        }
        let ttl = std::time::Duration::from_secs(self.metadata.cache_duration_secs);
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.metadata.last_modified.checked_add_signed(ttl))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|expiry| now >= expiry)
    }

    /// Check integrity, freshness, and (if given) provenance.
    pub fn verify(
        &self,
        expected_source: Option<&Url>,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), ModelRejection> {
        let actual = checksum(&self.payload);
        if !actual.eq_ignore_ascii_case(&self.metadata.sha256) {
            return Err(ModelRejection::Incompatible(format!(
                "payload checksum {} does not match recorded {}",
                actual, self.metadata.sha256
            )));
        }

        if self.is_expired_at(now) {
            return Err(ModelRejection::Expired);
        }

        if let (Some(expected), Some(found)) = (expected_source, &self.metadata.source) {
            if expected.as_str() != found {
                return Err(ModelRejection::SourceMismatch {
                    expected: expected.to_string(),
                    found: found.clone(),
                });
            }
        }

        Ok(())
    }

    /// Loader validator for this format.
    ///
    /// `expected_source` should be the loader's configured URL so a cache
    /// written for a different model URL is treated as stale.
    pub fn validator(expected_source: Option<Url>) -> Validator<RankerModel> {
        Arc::new(move |bytes: &[u8]| {
            let model = RankerModel::from_bytes(bytes)?;
            model.verify(expected_source.as_ref(), Utc::now())?;
            Ok(model)
        })
    }
}

/// Hex SHA-256 of `bytes`.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_envelope_payload_is_hex() {
        let model = RankerModel::new(vec![0xde, 0xad], None, 0);
        let json: serde_json::Value = serde_json::from_slice(&model.to_bytes().unwrap()).unwrap();
        assert_eq!(json["payload"], "dead");
        assert_eq!(json["metadata"]["sha256"], checksum(&[0xde, 0xad]));
    }

    #[test]
    fn test_parse_garbage_is_rejected() {
        assert!(matches!(
            RankerModel::from_bytes(b"not json"),
            Err(ModelRejection::Parse(_))
        ));
        assert!(matches!(
            RankerModel::from_bytes(br#"{"metadata":{"last_modified":"2025-01-01T00:00:00Z","sha256":""},"payload":"zz"}"#),
            Err(ModelRejection::Parse(_))
        ));
    }

    #[test]
    fn test_checksum_mismatch_is_incompatible() {
        let mut model = RankerModel::new(b"weights".to_vec(), None, 0);
        model.payload.push(b'!');
        assert!(matches!(
            model.verify(None, Utc::now()),
            Err(ModelRejection::Incompatible(_))
        ));
    }

    #[test]
    fn test_expiry() {
        let mut model = RankerModel::new(b"weights".to_vec(), None, 60);
        let now = Utc::now();
        assert!(model.verify(None, now).is_ok());
        assert!(model.is_expired_at(now + Duration::seconds(61)));
        assert_eq!(
            model.verify(None, now + Duration::seconds(61)),
            Err(ModelRejection::Expired)
        );

        model.metadata.cache_duration_secs = 0;
        assert_eq!(model.expires_at(), None);
        assert!(!model.is_expired_at(now + Duration::days(3650)));
    }

    #[test]
    fn test_source_mismatch() {
        let model = RankerModel::new(b"w".to_vec(), Some(&url("https://a.example/m")), 0);
        assert!(model.verify(Some(&url("https://a.example/m")), Utc::now()).is_ok());
        assert!(matches!(
            model.verify(Some(&url("https://b.example/m")), Utc::now()),
            Err(ModelRejection::SourceMismatch { .. })
        ));
        // Unrecorded source is not a mismatch.
        let anonymous = RankerModel::new(b"w".to_vec(), None, 0);
        assert!(anonymous.verify(Some(&url("https://b.example/m")), Utc::now()).is_ok());
    }

    #[test]
    fn test_validator_round_trip() {
        let source = url("https://models.example/ranker");
        let model = RankerModel::new(b"scores".to_vec(), Some(&source), 3600);
        let bytes = model.to_bytes().unwrap();

        let validator = RankerModel::validator(Some(source));
        assert_eq!(validator(&bytes).unwrap(), model);
        assert!(validator(b"").is_err());
    }
}
