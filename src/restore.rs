//! Backup bookkeeping, restoration, and the signal guard.
//!
//! The instrumenter records every file it rewrites here. Whatever path
//! the driver takes out of the instrumented region (success, error,
//! panic, or an interrupt), the table is drained exactly once:
//! restoration clears it so a later pass is a no-op.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Original bytes and permission bits of one touched file.
#[derive(Debug, Clone)]
pub struct FileBackup {
    pub data: Vec<u8>,
    pub permissions: fs::Permissions,
}

/// Backups keyed by absolute path, shared between the driver, the RAII
/// guard, and the signal task. Absence of an entry means nothing to
/// restore.
#[derive(Clone, Default)]
pub struct BackupSet {
    inner: Arc<Mutex<HashMap<PathBuf, FileBackup>>>,
}

impl BackupSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<PathBuf, FileBackup>> {
        // A poisoned lock still holds a usable table; restoration must not
        // give up because some other thread panicked mid-run.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, path: PathBuf, backup: FileBackup) {
        self.table().insert(path, backup);
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Write every entry back, best effort per file, and clear the table.
    pub fn restore_all(&self) {
        let drained: HashMap<PathBuf, FileBackup> = std::mem::take(&mut *self.table());
        for (path, backup) in drained {
            if let Err(err) = restore_file(&path, &backup) {
                eprintln!("[lx] restore failed ({}): {err:#}", path.display());
            }
        }
    }
}

fn restore_file(path: &Path, backup: &FileBackup) -> anyhow::Result<()> {
    fs::write(path, &backup.data)?;
    fs::set_permissions(path, backup.permissions.clone())?;
    Ok(())
}

/// Drains the backup table on drop, covering every exit out of the
/// instrumented region including panics.
pub struct RestoreGuard {
    backups: BackupSet,
}

impl RestoreGuard {
    pub fn new(backups: BackupSet) -> Self {
        Self { backups }
    }
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        self.backups.restore_all();
    }
}

/// Restore-and-exit on SIGINT or SIGTERM. The task holds its own handle to
/// the shared table; after a normal drain the table is empty and a late
/// signal restores nothing.
pub fn install_signal_guard(backups: BackupSet) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        eprintln!("\n[lx] forced termination detected, restoring source code");
        backups.restore_all();
        std::process::exit(1);
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_roundtrip_bytes_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.go");
        fs::write(&path, b"package main\n").unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o744)).unwrap();
        }
        let original = fs::read(&path).unwrap();
        let permissions = fs::metadata(&path).unwrap().permissions();

        let backups = BackupSet::new();
        backups.insert(
            path.clone(),
            FileBackup {
                data: original.clone(),
                permissions: permissions.clone(),
            },
        );

        fs::write(&path, b"package main\n// mutated\n").unwrap();
        backups.restore_all();

        assert_eq!(fs::read(&path).unwrap(), original);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(
                fs::metadata(&path).unwrap().permissions().mode() & 0o777,
                permissions.mode() & 0o777
            );
        }
    }

    #[test]
    fn test_restore_drains_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.go");
        fs::write(&path, b"one").unwrap();
        let permissions = fs::metadata(&path).unwrap().permissions();

        let backups = BackupSet::new();
        backups.insert(
            path.clone(),
            FileBackup {
                data: b"one".to_vec(),
                permissions,
            },
        );
        assert_eq!(backups.len(), 1);

        backups.restore_all();
        assert!(backups.is_empty());

        // A second restore must not rewrite anything.
        fs::write(&path, b"two").unwrap();
        backups.restore_all();
        assert_eq!(fs::read(&path).unwrap(), b"two");
    }

    #[test]
    fn test_guard_drop_restores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.go");
        fs::write(&path, b"original").unwrap();
        let permissions = fs::metadata(&path).unwrap().permissions();

        let backups = BackupSet::new();
        backups.insert(
            path.clone(),
            FileBackup {
                data: b"original".to_vec(),
                permissions,
            },
        );

        {
            let _guard = RestoreGuard::new(backups.clone());
            fs::write(&path, b"mutated").unwrap();
        }
        assert_eq!(fs::read(&path).unwrap(), b"original");
    }

    #[test]
    fn test_one_failed_entry_does_not_stop_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.go");
        fs::write(&good, b"good").unwrap();
        let permissions = fs::metadata(&good).unwrap().permissions();

        let backups = BackupSet::new();
        backups.insert(
            dir.path().join("missing/dir/bad.go"),
            FileBackup {
                data: b"bad".to_vec(),
                permissions: permissions.clone(),
            },
        );
        backups.insert(
            good.clone(),
            FileBackup {
                data: b"good".to_vec(),
                permissions,
            },
        );

        fs::write(&good, b"mutated").unwrap();
        backups.restore_all();

        assert_eq!(fs::read(&good).unwrap(), b"good");
        assert!(backups.is_empty());
    }
}
