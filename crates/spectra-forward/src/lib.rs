//! Content-hash deduplicating forwarder: at-most-once forwards across
//! primary, secondary and saved-messages destinations.

pub mod error;
pub mod forwarder;
pub mod hash;

pub use error::{ForwardError, Result};
pub use forwarder::{ChannelOutcome, ForwardOptions, ForwardReport, Forwarder};
pub use hash::content_hash;
