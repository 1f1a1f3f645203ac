//! Discovery and network-priority engine: link extraction from message
//! content, the recursive crawl, and the mention-graph priority analysis.

pub mod crawler;
pub mod error;
pub mod extract;
pub mod network;

pub use crawler::Discovery;
pub use error::{DiscoveryError, Result};
pub use network::NetworkAnalyzer;
