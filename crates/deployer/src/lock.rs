//! Instance lock — prevents two deployers on one host from claiming
//! overlapping port ranges.
//!
//! One file per live instance under the lock directory, named
//! `<start>-<stop>_<instance>.lock`, where `instance` is the first 16 hex
//! characters of the SHA-256 digest of the install path. Files whose
//! recorded pid is dead are reclaimed.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock directory {0} is not usable: {1}")]
    Directory(PathBuf, std::io::Error),
    #[error("port range [{start}, {stop}) overlaps a live instance holding {holder}")]
    Overlap {
        start: u16,
        stop: u16,
        holder: String,
    },
    #[error("could not write lock file {0}: {1}")]
    Write(PathBuf, std::io::Error),
}

/// Held for the lifetime of the process; the file is removed on drop.
pub struct InstanceLock {
    path: PathBuf,
}

/// First 16 hex chars of the SHA-256 of the install path.
pub fn instance_id(install_path: &Path) -> String {
    let digest = Sha256::digest(install_path.to_string_lossy().as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn lock_file_name(start: u16, stop: u16, instance: &str) -> String {
    format!("{}-{}_{}.lock", start, stop, instance)
}

/// Parse `<start>-<stop>_<instance>.lock`.
fn parse_lock_name(name: &str) -> Option<(u16, u16, String)> {
    let stem = name.strip_suffix(".lock")?;
    let (range, instance) = stem.split_once('_')?;
    let (start, stop) = range.split_once('-')?;
    Some((start.parse().ok()?, stop.parse().ok()?, instance.to_string()))
}

fn ranges_overlap(a_start: u16, a_stop: u16, b_start: u16, b_stop: u16) -> bool {
    a_start < b_stop && b_start < a_stop
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

fn recorded_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;
    contents.lines().find_map(|line| {
        line.strip_prefix("pid=")
            .and_then(|pid| pid.trim().parse().ok())
    })
}

impl InstanceLock {
    /// Acquire the lock for `[start, stop)` under `dir`, refusing when a
    /// live instance holds an overlapping range.
    pub fn acquire(
        dir: &Path,
        start: u16,
        stop: u16,
        install_path: &Path,
    ) -> Result<Self, LockError> {
        fs::create_dir_all(dir).map_err(|e| LockError::Directory(dir.to_path_buf(), e))?;

        let own_instance = instance_id(install_path);
        let entries =
            fs::read_dir(dir).map_err(|e| LockError::Directory(dir.to_path_buf(), e))?;

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((other_start, other_stop, other_instance)) = parse_lock_name(name) else {
                continue;
            };

            let entry_path = entry.path();
            let holder_alive = recorded_pid(&entry_path).map(pid_alive).unwrap_or(false);
            if !holder_alive {
                tracing::info!(lock = %entry_path.display(), "Reclaiming stale lock file");
                let _ = fs::remove_file(&entry_path);
                continue;
            }

            if other_instance == own_instance {
                // A live process of this same install already holds a lock.
                return Err(LockError::Overlap {
                    start,
                    stop,
                    holder: name.to_string(),
                });
            }

            if ranges_overlap(start, stop, other_start, other_stop) {
                return Err(LockError::Overlap {
                    start,
                    stop,
                    holder: name.to_string(),
                });
            }
        }

        let path = dir.join(lock_file_name(start, stop, &own_instance));
        let contents = format!(
            "pid={}\nrange={}-{}\ninstall={}\n",
            std::process::id(),
            start,
            stop,
            install_path.display()
        );
        fs::write(&path, contents).map_err(|e| LockError::Write(path.clone(), e))?;
        tracing::info!(lock = %path.display(), "Acquired instance lock");

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(
                lock = %self.path.display(),
                error = %e,
                "Could not remove lock file"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_instance_id_is_stable_16_hex() {
        let id1 = instance_id(Path::new("/opt/ctf-deployer"));
        let id2 = instance_id(Path::new("/opt/ctf-deployer"));
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 16);
        assert!(id1.chars().all(|c| c.is_ascii_hexdigit()));

        let other = instance_id(Path::new("/srv/ctf-deployer"));
        assert_ne!(id1, other);
    }

    #[test]
    fn test_lock_name_round_trip() {
        let name = lock_file_name(9000, 9100, "abcdef0123456789");
        assert_eq!(
            parse_lock_name(&name),
            Some((9000, 9100, "abcdef0123456789".to_string()))
        );
        assert_eq!(parse_lock_name("garbage"), None);
        assert_eq!(parse_lock_name("x-y_z.lock"), None);
    }

    #[test]
    fn test_ranges_overlap_half_open() {
        assert!(ranges_overlap(9000, 9100, 9050, 9150));
        assert!(ranges_overlap(9000, 9100, 9000, 9100));
        // Adjacent half-open ranges do not overlap.
        assert!(!ranges_overlap(9000, 9100, 9100, 9200));
        assert!(!ranges_overlap(9100, 9200, 9000, 9100));
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock =
            InstanceLock::acquire(dir.path(), 9000, 9100, Path::new("/opt/a")).unwrap();
        assert!(lock.path().exists());
        let path = lock.path().to_path_buf();
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_overlapping_live_lock_refused() {
        let dir = TempDir::new().unwrap();
        let _first =
            InstanceLock::acquire(dir.path(), 9000, 9100, Path::new("/opt/a")).unwrap();
        let second = InstanceLock::acquire(dir.path(), 9050, 9150, Path::new("/opt/b"));
        assert!(matches!(second, Err(LockError::Overlap { .. })));
    }

    #[test]
    fn test_disjoint_ranges_coexist() {
        let dir = TempDir::new().unwrap();
        let _first =
            InstanceLock::acquire(dir.path(), 9000, 9100, Path::new("/opt/a")).unwrap();
        let second = InstanceLock::acquire(dir.path(), 9100, 9200, Path::new("/opt/b"));
        assert!(second.is_ok());
    }

    #[test]
    fn test_stale_lock_reclaimed() {
        let dir = TempDir::new().unwrap();
        // A lock file whose pid is certainly dead.
        let stale = dir.path().join(lock_file_name(9000, 9100, "deadbeefdeadbeef"));
        fs::write(&stale, "pid=4294967294\nrange=9000-9100\n").unwrap();

        let lock = InstanceLock::acquire(dir.path(), 9000, 9100, Path::new("/opt/a"));
        assert!(lock.is_ok());
        assert!(!stale.exists());
    }

    #[test]
    fn test_unparseable_lock_file_ignored() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("README.txt"), "not a lock").unwrap();
        let lock = InstanceLock::acquire(dir.path(), 9000, 9100, Path::new("/opt/a"));
        assert!(lock.is_ok());
    }
}
