//! The CDC replication engine: per-stream lifecycle management and the
//! event router carrying changes from source adapters to targets with
//! at-least-once, checkpointed delivery.

mod manager;
mod router;
mod worker;

pub use manager::{EndpointHandle, ManagerOptions, ReplicationManager, StreamSpec};
pub use router::EventRouter;
