//! JSON-file record registry
//!
//! Keeps every interface and peer record in a single state file. The
//! registry only stores records; callers run them through the engine
//! before saving so derived fields (keys, addresses) are persisted.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;
use crate::error::{StoreError, ValidationError};

use super::{Interface, Peer, PeerId, RecordStore};

/// Current schema of the registry file
const SCHEMA_VERSION: u32 = 1;

/// Get the default registry path
pub fn default_registry_path() -> PathBuf {
    PathBuf::from("/var/lib/wgsync/registry.json")
}

/// Exclusive advisory lock on a registry file
///
/// Held through `flock(2)` on a sibling `<registry>.lock` file and released
/// when dropped. Cooperating processes serialize load, sync and save on it.
#[derive(Debug)]
pub struct RegistryLock {
    file: File,
    path: PathBuf,
}

impl RegistryLock {
    /// Take the lock, waiting for another holder to release it
    pub fn acquire(registry_path: &Path) -> Result<Self, StoreError> {
        match Self::try_acquire(registry_path) {
            Err(StoreError::Locked { path }) => {
                tracing::info!("Waiting for registry lock {}", path);
                let lock = Self::open(registry_path)?;
                lock.flock(true)?;
                Ok(lock)
            }
            result => result,
        }
    }

    /// Take the lock, failing with `Locked` if another holder has it
    pub fn try_acquire(registry_path: &Path) -> Result<Self, StoreError> {
        let lock = Self::open(registry_path)?;
        lock.flock(false)?;
        tracing::debug!("Acquired registry lock {:?}", lock.path);
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(registry_path: &Path) -> Result<Self, StoreError> {
        let mut name = registry_path.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);

        let lock_err = |source| StoreError::Lock {
            path: path.display().to_string(),
            source,
        };
        ensure_parent(&path).map_err(lock_err)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(lock_err)?;

        Ok(Self { file, path })
    }

    #[cfg(unix)]
    fn flock(&self, blocking: bool) -> Result<(), StoreError> {
        use std::os::unix::io::AsRawFd;

        let operation = if blocking {
            libc::LOCK_EX
        } else {
            libc::LOCK_EX | libc::LOCK_NB
        };
        if unsafe { libc::flock(self.file.as_raw_fd(), operation) } == 0 {
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            Err(StoreError::Locked {
                path: self.path.display().to_string(),
            })
        } else {
            Err(StoreError::Lock {
                path: self.path.display().to_string(),
                source: err,
            })
        }
    }

    #[cfg(not(unix))]
    fn flock(&self, _blocking: bool) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Create the parent directory of `path` owner/group-only if it is missing
fn ensure_parent(path: &Path) -> std::io::Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() || parent.exists() {
        return Ok(());
    }

    std::fs::create_dir_all(parent)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o750))?;
    }
    Ok(())
}

/// Interface and peer records, optionally backed by a file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    /// Schema version for future migrations
    schema_version: u32,
    #[serde(default)]
    interfaces: Vec<Interface>,
    #[serde(default)]
    peers: Vec<Peer>,
    #[serde(skip)]
    path: Option<PathBuf>,
    #[serde(skip)]
    lock: Option<Arc<RegistryLock>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            interfaces: Vec::new(),
            peers: Vec::new(),
            path: None,
            lock: None,
        }
    }
}

impl Registry {
    /// Registry that is never written to disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Lock the registry at `path`, then load it
    ///
    /// The lock is held until the registry is dropped, so a read, sync and
    /// save cycle cannot interleave with another process doing the same.
    pub fn load_locked(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let lock = RegistryLock::acquire(path.as_ref())?;
        let mut registry = Self::load(path)?;
        registry.lock = Some(Arc::new(lock));
        Ok(registry)
    }

    /// Like [`Registry::load_locked`] but fails with `Locked` instead of waiting
    pub fn try_load_locked(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let lock = RegistryLock::try_acquire(path.as_ref())?;
        let mut registry = Self::load(path)?;
        registry.lock = Some(Arc::new(lock));
        Ok(registry)
    }

    /// Whether this registry holds the file lock
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Load the registry at `path` without locking it
    ///
    /// A missing file yields an empty registry.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        let mut registry = match std::fs::read_to_string(path) {
            Ok(json) => {
                let registry: Registry =
                    serde_json::from_str(&json).map_err(|source| StoreError::Corrupt {
                        path: path.display().to_string(),
                        source,
                    })?;
                tracing::debug!(
                    "Loaded {} interfaces and {} peers from {:?}",
                    registry.interfaces.len(),
                    registry.peers.len(),
                    path
                );
                registry
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No registry found at {:?}, starting empty", path);
                Registry::default()
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        registry.path = Some(path.to_path_buf());
        Ok(registry)
    }

    /// Write the registry back to its file
    ///
    /// The file holds private keys, so it is created owner-only and
    /// replaced atomically.
    pub fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let write_err = |source| StoreError::Write {
            path: path.display().to_string(),
            source,
        };

        ensure_parent(path).map_err(write_err)?;

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

        // Created 0600 with a unique name next to the target
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(json.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(path).map_err(|e| write_err(e.error))?;
        tracing::debug!("Saved registry to {:?}", path);
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert or replace an interface, keyed by name
    pub fn upsert_interface(&mut self, interface: Interface) {
        match self.interfaces.iter_mut().find(|i| i.name == interface.name) {
            Some(existing) => *existing = interface,
            None => self.interfaces.push(interface),
        }
    }

    /// Insert a new peer; fails if the interface already has a peer of that name
    pub fn insert_peer(&mut self, peer: Peer) -> Result<(), ValidationError> {
        if self.interface(&peer.interface).is_none() {
            return Err(ValidationError::UnknownInterface {
                name: peer.interface,
            });
        }
        if self.peer(&peer.id()).is_some() {
            return Err(ValidationError::DuplicateName {
                name: peer.id().to_string(),
            });
        }
        self.peers.push(peer);
        Ok(())
    }

    /// Insert or replace a peer, keyed by interface and name
    pub fn upsert_peer(&mut self, peer: Peer) {
        let id = peer.id();
        match self.peers.iter_mut().find(|p| p.id() == id) {
            Some(existing) => *existing = peer,
            None => self.peers.push(peer),
        }
    }

    pub fn peer(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| &p.id() == id)
    }

    pub fn peer_by_public_key(&self, key: &PublicKey) -> Option<&Peer> {
        self.peers.iter().find(|p| p.public_key.as_ref() == Some(key))
    }

    /// Purge a peer record
    pub fn remove_peer(&mut self, id: &PeerId) -> Option<Peer> {
        let index = self.peers.iter().position(|p| &p.id() == id)?;
        Some(self.peers.remove(index))
    }

    /// Drop every stored private key, returning how many were removed
    ///
    /// Public keys stay, so the device configuration is unaffected.
    pub fn clear_private_keys(&mut self) -> usize {
        let mut count = 0;
        for peer in &mut self.peers {
            if let Some(key) = peer.private_key.take() {
                peer.public_key = Some(key.public_key());
                count += 1;
            }
        }
        count
    }
}

impl RecordStore for Registry {
    fn interfaces(&self) -> Vec<Interface> {
        self.interfaces.clone()
    }

    fn interface(&self, name: &str) -> Option<Interface> {
        self.interfaces.iter().find(|i| i.name == name).cloned()
    }

    fn peers(&self) -> Vec<Peer> {
        self.peers.clone()
    }
}
