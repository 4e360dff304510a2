mod config;
mod event_bus;
mod governance;
mod registry;
mod vcs;

pub use config::{DatabaseConfig, DatabaseKind, GatesConfig, ProjectConfig, CONFIG_FILE};
pub use event_bus::{
    spawn_audit_writer, EventBus, FilteredSubscription, DEFAULT_RING_CAPACITY,
};
pub use governance::{ApplyOutcome, Governance};
pub use registry::{ProjectContext, ProjectRegistry};
pub use vcs::{GitAdapter, RepoStatus};
