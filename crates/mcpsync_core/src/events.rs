use crate::manager::SyncStatus;
use crate::sync::SyncReport;
use mcpsync_registry::{HealthStatus, SyncTarget};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 128;

/// Engine-level notifications for the presentation layer.
///
/// Registry content changes are published separately on
/// [`ServerRegistry::subscribe`](mcpsync_registry::ServerRegistry::subscribe).
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A target file was edited outside the application
    ExternalChangesDetected { targets: Vec<SyncTarget> },
    /// Pending external edits were imported or discarded
    ExternalChangesResolved,
    SyncStatusesChanged(BTreeMap<SyncTarget, SyncStatus>),
    SyncStarted,
    SyncFinished(SyncReport),
    HealthChanged {
        id: String,
        name: String,
        previous: HealthStatus,
        current: HealthStatus,
    },
    HealthRoundCompleted { overall: HealthStatus },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: CoreEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
