//! Durable state store: one embedded SQLite file holding messages, media,
//! users, topics, account health, task state, discovered-group priorities,
//! mention edges and dedup hashes. WAL mode, retry-on-contention, custom
//! `PAGE()` SQL function for the dayline reader.

mod accounts;
mod channels;
mod db;
mod discovery;
mod forwarding;
mod messages;
mod store;
mod tasks;
pub mod error;
pub mod types;

pub use error::{Result, StoreError};
pub use messages::MessageInsert;
pub use store::{ChecksumTable, Store};
pub use types::*;
