//! Fleet orchestration: the per-account gateway pool, join/leave and batch
//! archive flows, the bounded account-aware task scheduler and the channel
//! access indexer.

pub mod error;
pub mod indexer;
pub mod manager;
pub mod scheduler;

pub use error::{FleetError, Result};
pub use indexer::ChannelAccessIndexer;
pub use manager::{ArchiveRunner, GroupManager};
pub use scheduler::{TaskFn, TaskOutcome, TaskScheduler};
