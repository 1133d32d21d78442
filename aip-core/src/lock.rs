//! Named mutual-exclusion locks, one per process id.
//!
//! A process that is not flagged for parallel execution holds the lock
//! `aip-<id>` for the whole of its run. A second run of the same id waits up
//! to its `lock_timeout` and then gives up.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

use crate::{AipError, ProcessId, Result};

/// Lock name guarding process `id`
pub fn lock_name(id: ProcessId) -> String {
    format!("aip-{id}")
}

/// One lock handle. Dropping an acquired handle releases it.
pub trait NamedLock: Send {
    fn name(&self) -> &str;

    /// Wait up to `timeout` for the lock. `Ok(false)` means it is still held
    /// elsewhere.
    fn acquire(&mut self, timeout: Duration) -> Result<bool>;

    fn is_acquired(&self) -> bool;

    fn release(&mut self) -> Result<()>;
}

/// Hands out lock handles by name
pub trait LockManager: Send + Sync {
    fn create_lock(&self, name: &str) -> Box<dyn NamedLock>;
}

#[derive(Debug, Default)]
struct LockTable {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Locks shared between threads of one process
#[derive(Debug, Clone, Default)]
pub struct MemoryLockManager {
    table: Arc<LockTable>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if anybody currently holds `name`
    pub fn is_held(&self, name: &str) -> bool {
        self.table
            .held
            .lock()
            .map(|held| held.contains(name))
            .unwrap_or(false)
    }
}

impl LockManager for MemoryLockManager {
    fn create_lock(&self, name: &str) -> Box<dyn NamedLock> {
        Box::new(MemoryLock {
            name: name.to_string(),
            table: Arc::clone(&self.table),
            acquired: false,
        })
    }
}

struct MemoryLock {
    name: String,
    table: Arc<LockTable>,
    acquired: bool,
}

impl NamedLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn acquire(&mut self, timeout: Duration) -> Result<bool> {
        if self.acquired {
            return Ok(true);
        }

        // no deadline when the timeout does not fit in an Instant
        let deadline = Instant::now().checked_add(timeout);
        let mut held = self
            .table
            .held
            .lock()
            .map_err(|_| AipError::storage("lock table poisoned"))?;
        while held.contains(&self.name) {
            held = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    self.table
                        .released
                        .wait_timeout(held, deadline - now)
                        .map_err(|_| AipError::storage("lock table poisoned"))?
                        .0
                }
                None => self
                    .table
                    .released
                    .wait(held)
                    .map_err(|_| AipError::storage("lock table poisoned"))?,
            };
        }
        held.insert(self.name.clone());
        self.acquired = true;
        Ok(true)
    }

    fn is_acquired(&self) -> bool {
        self.acquired
    }

    fn release(&mut self) -> Result<()> {
        if !self.acquired {
            return Ok(());
        }
        let mut held = self
            .table
            .held
            .lock()
            .map_err(|_| AipError::storage("lock table poisoned"))?;
        held.remove(&self.name);
        self.acquired = false;
        self.table.released.notify_all();
        Ok(())
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Locks shared between OS processes through lock files in one directory
///
/// A lock is held while `<dir>/<name>.lock` exists. Waiting callers poll with
/// exponential backoff. With a stale age configured, a lock file older than
/// that is assumed to belong to a crashed holder and is removed.
#[derive(Debug, Clone)]
pub struct FileLockManager {
    dir: PathBuf,
    stale_after: Option<Duration>,
}

impl FileLockManager {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            stale_after: None,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }
}

impl LockManager for FileLockManager {
    fn create_lock(&self, name: &str) -> Box<dyn NamedLock> {
        Box::new(FileLock {
            name: name.to_string(),
            path: self.dir.join(format!("{name}.lock")),
            stale_after: self.stale_after,
            acquired: false,
        })
    }
}

/// Polling policy for contended lock files
fn lock_polling_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(10))
        .with_max_interval(Duration::from_millis(500))
        .with_multiplier(2.0)
        .with_max_elapsed_time(None)
        .build()
}

struct FileLock {
    name: String,
    path: PathBuf,
    stale_after: Option<Duration>,
    acquired: bool,
}

impl FileLock {
    fn try_create(&self) -> io::Result<bool> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                writeln!(file, "{} {}", std::process::id(), chrono::Utc::now().to_rfc3339())?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove the lock file if it is older than the stale age
    fn take_over_stale(&self) -> io::Result<bool> {
        let Some(stale_after) = self.stale_after else {
            return Ok(false);
        };
        let modified = match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e),
        };
        let age = modified.elapsed().unwrap_or_default();
        if age <= stale_after {
            return Ok(false);
        }
        tracing::warn!(lock = %self.name, age_secs = age.as_secs(), "Taking over stale lock");
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e),
        }
    }
}

impl NamedLock for FileLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn acquire(&mut self, timeout: Duration) -> Result<bool> {
        if self.acquired {
            return Ok(true);
        }
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let deadline = Instant::now().checked_add(timeout);
        let mut policy = lock_polling_policy();
        loop {
            if self.try_create()? {
                self.acquired = true;
                return Ok(true);
            }
            if self.take_over_stale()? {
                continue;
            }

            let mut wait = policy.next_backoff().unwrap_or(Duration::from_millis(500));
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                wait = wait.min(deadline - now);
            }
            std::thread::sleep(wait);
        }
    }

    fn is_acquired(&self) -> bool {
        self.acquired
    }

    fn release(&mut self) -> Result<()> {
        if !self.acquired {
            return Ok(());
        }
        self.acquired = false;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(lock = %self.name, "Failed to release lock: {}", e);
        }
    }
}
