//! Durable credential persistence.
//!
//! The credential is a single JSON document (`accessToken`, `refreshToken`,
//! `expiry`, `lastUpdated`, `scopes`) written atomically with owner-only
//! permissions. `save` returns only after the data and the rename are on
//! disk.
//!
//! Every save or clear bumps a write generation. A caller that reads, awaits
//! something slow and then writes back can pass the generation it started
//! from to [`CredentialStore::save_if_unchanged`] so a logout or a new grant
//! that landed in between is not overwritten.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use docrelay_core::Credential;
use tracing::{debug, info};

use crate::error::{ProviderError, ProviderResult};

#[derive(Debug, Clone)]
enum Cached {
    Unloaded,
    Loaded(Option<Credential>),
}

/// File-backed credential store with an in-memory copy.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    cache: RwLock<Cached>,
    /// Serializes writers; holds the write generation.
    writes: Mutex<u64>,
}

impl CredentialStore {
    /// Creates a store backed by `path`. Nothing is read until [`load`](Self::load).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: RwLock::new(Cached::Unloaded),
            writes: Mutex::new(0),
        }
    }

    fn lock_writes(&self) -> MutexGuard<'_, u64> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current write generation.
    ///
    /// Read it before [`load`](Self::load) when the loaded value will be
    /// written back later.
    pub fn generation(&self) -> u64 {
        *self.lock_writes()
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the stored credential.
    ///
    /// A credential without an access token is reported as absent.
    pub fn load(&self) -> ProviderResult<Option<Credential>> {
        if let Cached::Loaded(credential) = &*self.cache.read().unwrap_or_else(PoisonError::into_inner)
        {
            return Ok(credential.clone());
        }

        // Filling the cache under the write lock keeps a concurrent clear
        // from being shadowed by a stale read.
        let _writes = self.lock_writes();
        let credential = self.read_file()?.filter(Credential::is_usable);
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) =
            Cached::Loaded(credential.clone());
        Ok(credential)
    }

    fn read_file(&self) -> ProviderResult<Option<Credential>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No credential file");
                return Ok(None);
            }
            Err(e) => {
                return Err(ProviderError::storage(format!(
                    "failed to read {}",
                    self.path.display()
                ))
                .with_source(e));
            }
        };

        let credential: Credential = serde_json::from_str(&content).map_err(|e| {
            ProviderError::storage(format!("failed to parse {}", self.path.display()))
                .with_source(e)
        })?;
        debug!(path = %self.path.display(), "Loaded credential");
        Ok(Some(credential))
    }

    /// Persists `credential`, replacing any previous one.
    pub fn save(&self, credential: &Credential) -> ProviderResult<()> {
        let mut generation = self.lock_writes();
        self.write_file(credential)?;
        *generation += 1;
        Ok(())
    }

    /// Persists `credential` only if nothing was saved or cleared since
    /// `expected` was read from [`generation`](Self::generation).
    ///
    /// Returns false, leaving the store untouched, when it changed.
    pub fn save_if_unchanged(
        &self,
        expected: u64,
        credential: &Credential,
    ) -> ProviderResult<bool> {
        let mut generation = self.lock_writes();
        if *generation != expected {
            debug!(expected, current = *generation, "Credential changed, skipping save");
            return Ok(false);
        }
        self.write_file(credential)?;
        *generation += 1;
        Ok(true)
    }

    fn write_file(&self, credential: &Credential) -> ProviderResult<()> {
        let storage_err = |what: &str, e: std::io::Error| {
            ProviderError::storage(format!("failed to {what} {}", self.path.display()))
                .with_source(e)
        };

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| storage_err("create directory for", e))?;

        let content = serde_json::to_vec_pretty(credential)
            .map_err(|e| ProviderError::internal("failed to serialize credential").with_source(e))?;

        let temp_path = self.path.with_extension("json.tmp");
        let mut file = open_private(&temp_path).map_err(|e| storage_err("create", e))?;
        file.write_all(&content)
            .and_then(|()| file.sync_all())
            .map_err(|e| storage_err("write", e))?;
        drop(file);

        fs::rename(&temp_path, &self.path).map_err(|e| storage_err("replace", e))?;
        // Directory fsync makes the rename itself durable.
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }

        *self.cache.write().unwrap_or_else(PoisonError::into_inner) =
            Cached::Loaded(Some(credential.clone()));
        debug!(path = %self.path.display(), "Saved credential");
        Ok(())
    }

    /// Erases the credential. Returns true if one was stored.
    pub fn clear(&self) -> ProviderResult<bool> {
        let mut generation = self.lock_writes();
        let removed = self.remove_file()?;
        *generation += 1;
        Ok(removed)
    }

    /// Erases the credential only if nothing was saved or cleared since
    /// `expected`. Returns `None` when the store changed in between.
    pub fn clear_if_unchanged(&self, expected: u64) -> ProviderResult<Option<bool>> {
        let mut generation = self.lock_writes();
        if *generation != expected {
            debug!(expected, current = *generation, "Credential changed, skipping clear");
            return Ok(None);
        }
        let removed = self.remove_file()?;
        *generation += 1;
        Ok(Some(removed))
    }

    fn remove_file(&self) -> ProviderResult<bool> {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let removed = match fs::remove_file(&self.path) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                return Err(ProviderError::storage(format!(
                    "failed to remove {}",
                    self.path.display()
                ))
                .with_source(e));
            }
        };
        *cache = Cached::Loaded(None);

        if removed {
            info!(path = %self.path.display(), "Cleared credential");
        }
        Ok(removed)
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}
