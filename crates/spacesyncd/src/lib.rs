//! spacesyncd - Replicated Object Space Sync Daemon
//!
//! This daemon provides:
//! - Per-object change-DAG storage (heads, orphans, content-addressed changes)
//! - Range-hash set reconciliation against remote peers
//! - Per-space sync orchestration with tombstone filtering and acl priority
//! - Space bootstrap pushes to peers that have never seen a space
//! - Persistent space fingerprints for crash-restart consistency

pub mod config;
pub mod container;
pub mod dag;
pub mod deletion;
pub mod diff;
pub mod remote;
pub mod server;
pub mod space;
pub mod storage;
pub mod syncer;

pub use config::Config;
pub use container::DiffContainer;
pub use deletion::DeletionState;
pub use diff::Diff;
pub use server::Server;
pub use space::SpaceSync;
pub use storage::SpaceStorage;
pub use syncer::DiffSyncer;
