//! Last known `mcpServers` content per target.
//!
//! Every write records the fingerprint of what it put on disk, and every
//! accepted external edit records what it read. A watcher notification whose
//! file still hashes to the recorded value is our own write (or an edit to
//! unrelated keys) and is not an external change.

use mcpsync_registry::{SyncTarget, TransportConfig};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Parsed server section of a target file, keyed by server name.
pub type ServerSection = BTreeMap<String, TransportConfig>;

/// Stable hash of a parsed server section.
pub fn fingerprint(section: &ServerSection) -> u64 {
    let bytes = serde_json::to_vec(section).unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

#[derive(Clone, Default)]
pub struct WriteLedger {
    entries: Arc<Mutex<HashMap<SyncTarget, u64>>>,
}

impl WriteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, target: SyncTarget, fingerprint: u64) {
        self.entries.lock().insert(target, fingerprint);
    }

    pub fn last(&self, target: SyncTarget) -> Option<u64> {
        self.entries.lock().get(&target).copied()
    }

    pub fn is_known(&self, target: SyncTarget, fingerprint: u64) -> bool {
        self.last(target) == Some(fingerprint)
    }

    pub fn forget(&self, target: SyncTarget) {
        self.entries.lock().remove(&target);
    }
}
