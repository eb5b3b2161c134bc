// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! On-disk model cache.
//!
//! The cache file is an opaque blob; its structure belongs to whatever
//! validator the loader was built with. This module only moves whole-file
//! contents in and out, atomically enough that a reader in another process
//! never observes a half-written model:
//!
//! - reads take a shared lock on a sibling `.lock` file
//! - writes take an exclusive lock, write a `.tmp` sibling, `sync_all`, then
//!   rename over the cache file while the lock is still held
//!
//! All filesystem work runs on tokio's blocking pool so the loader's driver
//! task is never stalled by disk I/O.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use futures_util::future::BoxFuture;

/// Default timeout for acquiring the cache lock file.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Read/write access to the model cache file.
///
/// `read` resolves to the file's full contents. Any error (missing file,
/// permission problem, lock timeout) is a failed read to the loader.
pub trait ModelCache: Send + Sync {
    fn read(&self, path: &Path) -> BoxFuture<'static, io::Result<Vec<u8>>>;
    fn write(&self, path: &Path, bytes: Vec<u8>) -> BoxFuture<'static, Result<()>>;
}

/// `path` + `suffix`, keeping any existing extension.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Lock file guarding `path`.
pub fn lock_path(path: &Path) -> PathBuf {
    sibling(path, ".lock")
}

/// Filesystem-backed cache with advisory locking.
#[derive(Debug, Clone)]
pub struct FileCache {
    lock_timeout: Duration,
}

impl Default for FileCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FileCache {
    pub fn new() -> Self {
        Self {
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    /// Use a custom timeout for lock acquisition.
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self { lock_timeout }
    }

    fn open_lock_file(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
    }

    /// Spin on `try_lock` until it succeeds or `timeout` elapses.
    fn lock_with_timeout(
        file: &File,
        timeout: Duration,
        exclusive: bool,
    ) -> io::Result<()> {
        let start = Instant::now();
        loop {
            let attempt = if exclusive {
                FileExt::try_lock_exclusive(file)
            } else {
                FileExt::try_lock_shared(file)
            };
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("timed out after {:?} waiting for cache lock", timeout),
                        ));
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Blocking read of the whole cache file under a shared lock.
    pub fn read_blocking(path: &Path, timeout: Duration) -> io::Result<Vec<u8>> {
        if !path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no cached model at {:?}", path),
            ));
        }

        // An unopenable lock file (read-only directory) still allows a read.
        let _guard = match Self::open_lock_file(&lock_path(path)) {
            Ok(lock_file) => {
                Self::lock_with_timeout(&lock_file, timeout, false)?;
                Some(lock_file)
            }
            Err(e) => {
                tracing::debug!("Reading {:?} without lock: {}", path, e);
                None
            }
        };

        fs::read(path)
    }

    /// Blocking atomic write of the whole cache file under an exclusive lock.
    pub fn write_blocking(path: &Path, bytes: &[u8], timeout: Duration) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create cache directory: {:?}", parent))?;
            }
        }

        let lock_file_path = lock_path(path);
        let lock_file = Self::open_lock_file(&lock_file_path)
            .with_context(|| format!("Failed to open lock file: {:?}", lock_file_path))?;
        Self::lock_with_timeout(&lock_file, timeout, true)
            .with_context(|| format!("Failed to lock cache file: {:?}", path))?;

        let temp_path = sibling(path, ".tmp");
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file
                .write_all(bytes)
                .with_context(|| "Failed to write model to temp file")?;
            temp_file
                .sync_all()
                .with_context(|| "Failed to sync temp file to disk")?;
        }

        fs::rename(&temp_path, path).with_context(|| {
            format!("Failed to move temp file into place: {:?} -> {:?}", temp_path, path)
        })?;

        // Lock is released when lock_file is dropped here
        Ok(())
    }

    /// Delete the cache file and its lock file.
    ///
    /// Returns `false` if there was nothing cached.
    pub fn remove(path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }

        let lock_file_path = lock_path(path);
        {
            let lock_file = Self::open_lock_file(&lock_file_path)
                .with_context(|| format!("Failed to open lock file: {:?}", lock_file_path))?;
            Self::lock_with_timeout(&lock_file, LOCK_TIMEOUT, true)
                .with_context(|| format!("Failed to lock cache file: {:?}", path))?;
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove cached model: {:?}", path))?;
        }

        if let Err(e) = fs::remove_file(&lock_file_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove lock file {:?}: {}", lock_file_path, e);
            }
        }
        Ok(true)
    }
}

impl ModelCache for FileCache {
    fn read(&self, path: &Path) -> BoxFuture<'static, io::Result<Vec<u8>>> {
        let path = path.to_path_buf();
        let timeout = self.lock_timeout;
        Box::pin(async move {
            tokio::task::spawn_blocking(move || Self::read_blocking(&path, timeout))
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
        })
    }

    fn write(&self, path: &Path, bytes: Vec<u8>) -> BoxFuture<'static, Result<()>> {
        let path = path.to_path_buf();
        let timeout = self.lock_timeout;
        Box::pin(async move {
            match tokio::task::spawn_blocking(move || Self::write_blocking(&path, &bytes, timeout))
                .await
            {
                Ok(result) => result,
                Err(e) => bail!("Cache write task failed: {}", e),
            }
        })
    }
}
