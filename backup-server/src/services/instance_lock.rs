use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = ".backup.lock";

/// Exclusive advisory lock on a backup directory, held for the life of the
/// process so two servers never schedule dumps into the same directory.
pub struct InstanceLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            anyhow::anyhow!(
                "{} is locked by another backup server ({})",
                dir.display(),
                errno
            )
        })?;

        tracing::info!("Acquired instance lock {}", path.display());
        Ok(Self { _lock: lock, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let first = InstanceLock::acquire(dir.path()).unwrap();
        assert!(first.path().ends_with(LOCK_FILE));
        assert!(InstanceLock::acquire(dir.path()).is_err());

        drop(first);
        assert!(InstanceLock::acquire(dir.path()).is_ok());
    }
}
