//! Daemon wiring: the explicit runtime context, the periodic orchestrator
//! loops and the throttled cross-account invitation queue.

pub mod invites;
pub mod orchestrator;
pub mod runtime;

pub use invites::InvitationQueue;
pub use orchestrator::Orchestrator;
pub use runtime::Runtime;
