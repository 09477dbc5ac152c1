pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod raft;
pub mod replication;
pub mod storage;

pub use config::{GroupConfig, MemberConfig, NodeConfig, RaftConfiguration};
pub use error::{Error, Result};
pub use raft::{RaftGroup, RaftNode, RaftTicker};
pub use replication::{EventStoreApplier, EventStoreSnapshotManager};
pub use storage::{Event, EventStore, EventTypeContext, StorageProperties};
