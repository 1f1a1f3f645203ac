//! Abstract Telegram transport: the trait set the core is written against,
//! the gateway error taxonomy, link classification, proxy rotation, and a
//! scripted in-memory gateway used by tests.

pub mod error;
pub mod gateway;
pub mod link;
pub mod mock;
pub mod proxy;
pub mod types;

pub use error::{GatewayError, Result};
pub use gateway::{GatewayConnector, GatewayProvider, TelegramGateway};
pub use link::GroupLink;
pub use proxy::{ProxyCycler, ProxyEndpoint, ProxyKind};
pub use types::{
    DialogEntry, EntityInfo, EntityKind, GatewayFile, GatewayMedia, GatewayMessage, GatewaySender,
    MediaKind, MessageQuery,
};
