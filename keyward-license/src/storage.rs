//! Encrypted persistence of licensing records.
//!
//! Records are JSON documents sealed with ChaCha20-Poly1305 under a key
//! derived from the product id and the machine fingerprint. [`RecordStore`]
//! is the raw byte-level backend; [`SecureStore`] seals and opens on top of it.

use crate::config::StorageScope;
use crate::error::{LicenseError, LicenseResult};
use keyward_crypto::{DerivedKey, KdfParams, derive_store_key, open_bytes, seal_bytes};
use keyward_types::ProductId;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Names of the records kept per product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Activation,
    Trial,
    LocalTrial,
    PendingRequest,
    PendingDeactivation,
    DeviceKey,
}

impl RecordKey {
    pub fn name(self) -> &'static str {
        match self {
            Self::Activation => "activation",
            Self::Trial => "trial",
            Self::LocalTrial => "local_trial",
            Self::PendingRequest => "pending_request",
            Self::PendingDeactivation => "pending_deactivation",
            Self::DeviceKey => "device_key",
        }
    }
}

/// Byte-level record storage.
pub trait RecordStore: Send + Sync + std::fmt::Debug {
    fn load(&self, key: RecordKey) -> LicenseResult<Option<Vec<u8>>>;
    fn save(&self, key: RecordKey, bytes: &[u8]) -> LicenseResult<()>;
    fn remove(&self, key: RecordKey) -> LicenseResult<()>;
}

/// Records kept only for the life of the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<RecordKey, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<RecordKey, Vec<u8>>> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl RecordStore for MemoryStore {
    fn load(&self, key: RecordKey) -> LicenseResult<Option<Vec<u8>>> {
        Ok(self.records().get(&key).cloned())
    }

    fn save(&self, key: RecordKey, bytes: &[u8]) -> LicenseResult<()> {
        self.records().insert(key, bytes.to_vec());
        Ok(())
    }

    fn remove(&self, key: RecordKey) -> LicenseResult<()> {
        self.records().remove(&key);
        Ok(())
    }
}

/// One file per record under a product directory.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens (creating if needed) the store directory.
    pub fn open(dir: impl Into<PathBuf>) -> LicenseResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, &e))?;
        Ok(Self { dir })
    }

    /// Opens the store for `product_id` in the directory `scope` selects.
    ///
    /// `base_override` replaces the platform directory for both scopes.
    pub fn for_scope(
        scope: StorageScope,
        product_id: &ProductId,
        base_override: Option<&Path>,
    ) -> LicenseResult<Self> {
        let base = match (scope, base_override) {
            (_, Some(dir)) => dir.to_path_buf(),
            (StorageScope::User, None) => dirs::data_local_dir()
                .map(|d| d.join("keyward"))
                .ok_or_else(|| LicenseError::Storage("no user data directory".to_string()))?,
            (StorageScope::System, None) => system_data_dir(),
            (StorageScope::InMemory, None) => {
                return Err(LicenseError::Storage(
                    "in-memory scope has no directory".to_string(),
                ));
            }
        };
        let dir = base.join(product_id.to_string());

        let store = Self::open(&dir).map_err(|e| match (scope, e) {
            (StorageScope::System, LicenseError::FilePermission(msg)) => {
                LicenseError::SystemPermission(msg)
            }
            (_, e) => e,
        })?;
        if scope == StorageScope::System {
            store.check_writable()?;
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: RecordKey) -> PathBuf {
        self.dir.join(format!("{}.dat", key.name()))
    }

    fn check_writable(&self) -> LicenseResult<()> {
        let marker = self.dir.join(".writable");
        fs::write(&marker, b"")
            .and_then(|()| fs::remove_file(&marker))
            .map_err(|e| LicenseError::SystemPermission(format!("{}: {e}", self.dir.display())))
    }
}

impl RecordStore for FileStore {
    fn load(&self, key: RecordKey) -> LicenseResult<Option<Vec<u8>>> {
        let path = self.path(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, &e)),
        }
    }

    fn save(&self, key: RecordKey, bytes: &[u8]) -> LicenseResult<()> {
        let path = self.path(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|e| io_error(&tmp, &e))?;
        fs::rename(&tmp, &path).map_err(|e| io_error(&path, &e))
    }

    fn remove(&self, key: RecordKey) -> LicenseResult<()> {
        let path = self.path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, &e)),
        }
    }
}

fn io_error(path: &Path, err: &std::io::Error) -> LicenseError {
    if err.kind() == ErrorKind::PermissionDenied {
        LicenseError::FilePermission(format!("{}: {err}", path.display()))
    } else {
        LicenseError::Storage(format!("{}: {err}", path.display()))
    }
}

fn system_data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("PROGRAMDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"))
            .join("keyward")
    }

    #[cfg(target_os = "macos")]
    {
        PathBuf::from("/Library/Application Support/keyward")
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        PathBuf::from("/var/lib/keyward")
    }
}

/// Sealed, typed view over a [`RecordStore`].
pub struct SecureStore {
    backend: Box<dyn RecordStore>,
    key: DerivedKey,
}

impl SecureStore {
    /// Wraps `backend`, deriving the sealing key for this product and machine.
    pub fn new(
        backend: Box<dyn RecordStore>,
        product_id: &ProductId,
        fingerprint: &str,
        kdf: &KdfParams,
    ) -> LicenseResult<Self> {
        let key = derive_store_key(&product_id.to_string(), fingerprint, kdf)?;
        Ok(Self { backend, key })
    }

    /// Loads a record. Records that fail to open are logged and treated as absent.
    pub fn load<T: DeserializeOwned>(&self, key: RecordKey) -> LicenseResult<Option<T>> {
        let Some(sealed) = self.backend.load(key)? else {
            return Ok(None);
        };
        let plain = match open_bytes(&self.key, &sealed) {
            Ok(plain) => plain,
            Err(e) => {
                warn!("discarding unreadable {} record: {e}", key.name());
                return Ok(None);
            }
        };
        match serde_json::from_slice(&plain) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("discarding malformed {} record: {e}", key.name());
                Ok(None)
            }
        }
    }

    pub fn save<T: Serialize>(&self, key: RecordKey, value: &T) -> LicenseResult<()> {
        let plain = serde_json::to_vec(value)?;
        let sealed = seal_bytes(&self.key, &plain)?;
        self.backend.save(key, &sealed)?;
        debug!("saved {} record", key.name());
        Ok(())
    }

    /// Saves `Some` values and removes the record for `None`.
    pub fn put<T: Serialize>(&self, key: RecordKey, value: Option<&T>) -> LicenseResult<()> {
        match value {
            Some(v) => self.save(key, v),
            None => self.remove(key),
        }
    }

    pub fn remove(&self, key: RecordKey) -> LicenseResult<()> {
        self.backend.remove(key)
    }
}

impl std::fmt::Debug for SecureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStore")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}
