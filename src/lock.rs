//! Advisory file locks that work across processes.
//!
//! A [`FileLock`] holds an OS-level advisory lock (`flock` on Unix,
//! `LockFileEx` on Windows, via `fs2`) on a lock file. Exclusive locks exclude
//! every other holder of the same path; shared locks coexist with other shared
//! locks and exclude exclusive ones. Each lock opens its own file handle, so
//! two locks taken by threads of one process contend exactly like locks taken
//! by two processes.
//!
//! Blocking acquisition polls at a fixed interval until the lock is obtained,
//! the timeout elapses ([`Error::LockTimeout`]) or a [`CancelToken`] fires
//! ([`Error::LockCancelled`]).

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::{Error, Result};

/// Default time to wait for a lock.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between attempts while waiting for a contended lock.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Strength of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many readers at once
    Shared,
    /// A single writer
    Exclusive,
}

/// Cancellation signal for a blocking lock wait.
///
/// Clones share the same flag, so one clone can be handed to another thread
/// (or a signal handler) to abort a wait in progress.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How long and how often to try for a lock.
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub cancel: Option<CancelToken>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            cancel: None,
        }
    }
}

impl LockOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

/// A held advisory lock. Released by [`FileLock::release`] or on drop.
#[derive(Debug)]
pub struct FileLock {
    /// Open handle carrying the OS lock; `None` once released
    file: Option<File>,
    path: PathBuf,
    mode: LockMode,
}

impl FileLock {
    /// Block until an exclusive lock on `path` is held.
    pub fn acquire_exclusive(path: &Path, opts: &LockOptions) -> Result<Self> {
        Self::acquire(path, LockMode::Exclusive, opts)
    }

    /// Block until a shared lock on `path` is held.
    pub fn acquire_shared(path: &Path, opts: &LockOptions) -> Result<Self> {
        Self::acquire(path, LockMode::Shared, opts)
    }

    /// Block until a lock of the given mode is held, the timeout elapses, or
    /// the cancel token fires.
    pub fn acquire(path: &Path, mode: LockMode, opts: &LockOptions) -> Result<Self> {
        let file = open_lock_file(path)?;
        let start = Instant::now();

        loop {
            if try_lock(&file, mode).map_err(|e| Error::io("lock", path, e))? {
                tracing::debug!(path = %path.display(), ?mode, "lock acquired");
                return Ok(Self {
                    file: Some(file),
                    path: path.to_path_buf(),
                    mode,
                });
            }

            if opts.is_cancelled() {
                return Err(Error::LockCancelled {
                    path: path.to_path_buf(),
                });
            }

            let elapsed = start.elapsed();
            if elapsed >= opts.timeout {
                return Err(Error::LockTimeout {
                    path: path.to_path_buf(),
                    timeout: opts.timeout,
                });
            }

            tracing::trace!(path = %path.display(), ?mode, "lock contended, waiting");
            thread::sleep(opts.poll_interval.min(opts.timeout - elapsed));
        }
    }

    /// Take an exclusive lock if it is free. `Ok(None)` means contended.
    pub fn try_exclusive(path: &Path) -> Result<Option<Self>> {
        Self::try_acquire(path, LockMode::Exclusive)
    }

    /// Take a shared lock if no exclusive holder exists. `Ok(None)` means contended.
    pub fn try_shared(path: &Path) -> Result<Option<Self>> {
        Self::try_acquire(path, LockMode::Shared)
    }

    fn try_acquire(path: &Path, mode: LockMode) -> Result<Option<Self>> {
        let file = open_lock_file(path)?;
        if !try_lock(&file, mode).map_err(|e| Error::io("lock", path, e))? {
            return Ok(None);
        }
        tracing::debug!(path = %path.display(), ?mode, "lock acquired");
        Ok(Some(Self {
            file: Some(file),
            path: path.to_path_buf(),
            mode,
        }))
    }

    /// Release the lock. Safe to call any number of times.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                // Closing the handle below drops the OS lock regardless.
                tracing::warn!(path = %self.path.display(), error = %e, "unlock failed");
            }
            tracing::debug!(path = %self.path.display(), mode = ?self.mode, "lock released");
        }
    }

    /// Path of the lock file this lock guards.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io("create lock dir", parent, e))?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| Error::io("open lock file", path, e))
}

/// One non-blocking attempt. `Ok(false)` when another holder conflicts.
fn try_lock(file: &File, mode: LockMode) -> io::Result<bool> {
    let attempt = match mode {
        LockMode::Shared => FileExt::try_lock_shared(file),
        LockMode::Exclusive => FileExt::try_lock_exclusive(file),
    };
    match attempt {
        Ok(()) => Ok(true),
        Err(e) if is_contended(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

fn is_contended(e: &io::Error) -> bool {
    let contended = fs2::lock_contended_error();
    e.kind() == io::ErrorKind::WouldBlock
        || (e.raw_os_error().is_some() && e.raw_os_error() == contended.raw_os_error())
}
