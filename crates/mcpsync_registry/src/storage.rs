//! Durable storage for the server registry.
//!
//! JSON snapshot written via temp-file-then-rename with a three-deep backup
//! rotation. `DebouncedStorage` coalesces frequent metadata-only saves
//! (health results) while user mutations go through `save_immediate`.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex as PLMutex;
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, RegistryResult};
use crate::model::Server;

pub const SCHEMA_VERSION: u32 = 1;

const REGISTRY_FILE: &str = "registry.json";

/// Everything the registry persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub schema_version: u32,
    /// Monotonic change counter; older snapshots never overwrite newer ones
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub servers: Vec<Server>,
}

impl Default for RegistrySnapshot {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            revision: 0,
            servers: Vec::new(),
        }
    }
}

/// Low-level storage for registry data.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
    /// Highest revision written so far, shared by every clone
    written: Arc<PLMutex<Option<u64>>>,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            written: Arc::new(PLMutex::new(None)),
        }
    }

    pub fn load(&self) -> RegistryResult<RegistrySnapshot> {
        let path = self.file_path();
        if !path.exists() {
            return Ok(RegistrySnapshot::default());
        }
        let data =
            fs::read_to_string(&path).map_err(|e| RegistryError::ReadError(e.to_string()))?;
        let snapshot = match serde_json::from_str::<RegistrySnapshot>(&data) {
            Ok(s) => s,
            Err(parse_err) => {
                if let Some(backup) = self.load_from_backup() {
                    log::warn!(
                        "registry file {} is corrupt ({}), restored from backup",
                        path.display(),
                        parse_err
                    );
                    return self.migrate(backup);
                }
                return Err(RegistryError::ParseError(parse_err.to_string()));
            }
        };
        let snapshot = self.migrate(snapshot)?;
        *self.written.lock() = Some(snapshot.revision);
        Ok(snapshot)
    }

    fn load_from_backup(&self) -> Option<RegistrySnapshot> {
        let backup_path = self.file_path().with_extension("json.bak");
        if !backup_path.exists() {
            return None;
        }
        let data = fs::read_to_string(&backup_path).ok()?;
        serde_json::from_str::<RegistrySnapshot>(&data).ok()
    }

    fn migrate(&self, mut snapshot: RegistrySnapshot) -> RegistryResult<RegistrySnapshot> {
        if snapshot.schema_version > SCHEMA_VERSION {
            return Err(RegistryError::ParseError(format!(
                "registry schema version {} is newer than supported version {}",
                snapshot.schema_version, SCHEMA_VERSION
            )));
        }
        if snapshot.schema_version < SCHEMA_VERSION {
            snapshot.schema_version = SCHEMA_VERSION;
        }
        Ok(snapshot)
    }

    /// Write the snapshot unless a newer revision is already on disk.
    pub fn save(&self, snapshot: &RegistrySnapshot) -> RegistryResult<()> {
        let mut written = self.written.lock();
        if let Some(last) = *written {
            if snapshot.revision < last {
                return Ok(());
            }
        }

        let path = self.file_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| RegistryError::WriteError(e.to_string()))?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let file =
            fs::File::create(&tmp_path).map_err(|e| RegistryError::WriteError(e.to_string()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, snapshot)
            .map_err(|e| RegistryError::SerializeError(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| RegistryError::WriteError(e.to_string()))?;
        drop(writer);

        self.rotate_backups(&path);
        fs::rename(&tmp_path, &path).map_err(|e| RegistryError::WriteError(e.to_string()))?;
        *written = Some(snapshot.revision);
        Ok(())
    }

    fn rotate_backups(&self, path: &Path) {
        if !path.exists() {
            return;
        }

        let bak2 = path.with_extension("json.bak.2");
        let bak1 = path.with_extension("json.bak.1");
        let bak = path.with_extension("json.bak");

        let _ = fs::remove_file(&bak2);
        if bak1.exists() {
            let _ = fs::rename(&bak1, &bak2);
        }
        if bak.exists() {
            let _ = fs::rename(&bak, &bak1);
        }
        let _ = fs::copy(path, &bak);
    }

    pub fn file_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }
}

pub fn default_storage_root() -> PathBuf {
    mcpsync_shared::app_dir().unwrap_or_else(|_| Path::new(".").join(".mcpsync"))
}

enum SaveMessage {
    Save,
    Shutdown,
}

/// Debounced storage wrapper that coalesces rapid saves.
pub struct DebouncedStorage {
    storage: Storage,
    sender: Sender<SaveMessage>,
    pending: Arc<PLMutex<Option<RegistrySnapshot>>>,
    worker: Option<JoinHandle<()>>,
}

impl DebouncedStorage {
    /// Creates a new debounced storage with the given debounce delay in milliseconds.
    pub fn new(storage: Storage, debounce_ms: u64) -> Self {
        let (sender, receiver) = mpsc::channel();
        let pending: Arc<PLMutex<Option<RegistrySnapshot>>> = Arc::new(PLMutex::new(None));
        let pending_clone = pending.clone();
        let storage_clone = storage.clone();
        let debounce = Duration::from_millis(debounce_ms);

        let worker = thread::Builder::new()
            .name("mcpsync-registry-save".to_string())
            .spawn(move || {
                Self::worker_loop(receiver, storage_clone, pending_clone, debounce);
            })
            .ok();

        Self {
            storage,
            sender,
            pending,
            worker,
        }
    }

    /// Queues a save operation (will be debounced).
    pub fn save(&self, snapshot: &RegistrySnapshot) -> RegistryResult<()> {
        if self.worker.is_none() {
            return self.storage.save(snapshot);
        }
        *self.pending.lock() = Some(snapshot.clone());
        let _ = self.sender.send(SaveMessage::Save);
        Ok(())
    }

    /// Forces an immediate save, bypassing the debounce. Any queued older
    /// snapshot is discarded.
    pub fn save_immediate(&self, snapshot: &RegistrySnapshot) -> RegistryResult<()> {
        self.pending.lock().take();
        self.storage.save(snapshot)
    }

    pub fn load(&self) -> RegistryResult<RegistrySnapshot> {
        self.storage.load()
    }

    /// Write whatever is queued right now.
    pub fn flush(&self) -> RegistryResult<()> {
        if let Some(snap) = self.pending.lock().take() {
            self.storage.save(&snap)?;
        }
        Ok(())
    }

    pub fn file_path(&self) -> PathBuf {
        self.storage.file_path()
    }

    fn worker_loop(
        receiver: Receiver<SaveMessage>,
        storage: Storage,
        pending: Arc<PLMutex<Option<RegistrySnapshot>>>,
        debounce: Duration,
    ) {
        let mut last_request: Option<Instant> = None;

        loop {
            let timeout = if last_request.is_some() {
                debounce
            } else {
                Duration::from_secs(60)
            };

            match receiver.recv_timeout(timeout) {
                Ok(SaveMessage::Save) => {
                    last_request = Some(Instant::now());
                }
                Ok(SaveMessage::Shutdown) => {
                    if let Some(snap) = pending.lock().take() {
                        let _ = storage.save(&snap);
                    }
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if let Some(t) = last_request {
                        if t.elapsed() >= debounce {
                            if let Some(snap) = pending.lock().take() {
                                if let Err(e) = storage.save(&snap) {
                                    log::warn!("debounced registry save failed: {}", e);
                                }
                            }
                            last_request = None;
                        }
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

impl Drop for DebouncedStorage {
    fn drop(&mut self) {
        let _ = self.sender.send(SaveMessage::Shutdown);
        if let Some(snap) = self.pending.lock().take() {
            let _ = self.storage.save(&snap);
        }
        if let Some(w) = self.worker.take() {
            let _ = w.join();
        }
    }
}
