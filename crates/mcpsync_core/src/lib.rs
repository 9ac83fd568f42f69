//! Synchronization engine for MCP server definitions.
//!
//! [`SyncCore`] wires the services together: the [`ServerRegistry`] holds the
//! canonical servers, the [`ConfigurationManager`] reconciles them with the
//! config files of the consuming apps, the [`SyncService`] writes them out and
//! the [`HealthMonitor`] keeps their live status current.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let core = SyncCore::new(Settings::load(), None, Collaborators::default())?;
//! core.load().await?;
//! core.start()?;
//! core.sync().sync().await?;
//! core.shutdown();
//! ```
//!
//! [`ServerRegistry`]: mcpsync_registry::ServerRegistry

pub mod collaborators;
pub mod config_watcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod ledger;
pub mod manager;
pub mod settings;
pub mod sync;
pub mod targets;
pub mod watcher;

pub use collaborators::{LogNotifier, NoopProcessControl, Notifier, ProcessControl};
pub use engine::{Collaborators, LoadSummary, SyncCore};
pub use error::{McpSyncError, McpSyncResult};
pub use events::{CoreEvent, EventBus};
pub use health::{DefaultProber, HealthMonitor, ProbeResult, Prober};
pub use manager::{ConfigurationManager, ImportSummary, MergePlan, SyncStatus};
pub use settings::{MergePolicy, Settings, SharedSettings};
pub use sync::{SyncReport, SyncService, TargetOutcome};

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
