//! Per-target lock so two local deploys never interleave on one host.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use fs4::FileExt;

use crate::types::Target;

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Default time to wait for another deploy to the same target to finish.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(15);

/// Exclusive advisory lock on `<locks>/<key>.lock` for one target.
///
/// The file itself is never removed. The OS drops the lock when the holder
/// exits, so a killed deploy does not block the next one. While held, the
/// file names the holder's pid.
#[derive(Debug)]
pub struct HostLock {
    path: PathBuf,
    file: File,
}

impl HostLock {
    /// Take the lock for `target`, waiting up to `wait` for a current holder.
    pub fn acquire(locks_dir: &Path, target: &Target, wait: Duration) -> anyhow::Result<Self> {
        fs::create_dir_all(locks_dir).with_context(|| {
            format!("Failed to create lock directory: {}", locks_dir.display())
        })?;
        let path = locks_dir.join(format!("{}.lock", target_key(target)));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open host lock: {}", path.display()))?;
        let deadline = Instant::now() + wait;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        let holder = fs::read_to_string(&path).unwrap_or_default();
                        anyhow::bail!(
                            "Another deploy to {} is in progress (lock {} held by pid {})",
                            target,
                            path.display(),
                            holder.split_whitespace().next().unwrap_or("unknown")
                        );
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to acquire host lock: {}", path.display())
                    });
                }
            }
        }

        if let Err(e) = write_holder(&file, target) {
            tracing::debug!(lock = %path.display(), error = %e, "could not record lock holder");
        }
        tracing::debug!(%target, lock = %path.display(), "acquired host lock");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HostLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(lock = %self.path.display(), error = %e, "failed to release host lock");
        }
    }
}

fn write_holder(mut file: &File, target: &Target) -> std::io::Result<()> {
    file.set_len(0)?;
    writeln!(file, "{} {}", std::process::id(), target)
}

/// Stable file-name key for a target.
pub fn target_key(target: &Target) -> String {
    blake3::hash(target.as_str().as_bytes()).to_hex().to_string()
}
