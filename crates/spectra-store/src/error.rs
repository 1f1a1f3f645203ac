use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database busy after {attempts} attempts: {last}")]
    Contention { attempts: u32, last: String },

    #[error("Invalid stored timestamp '{0}'")]
    BadTimestamp(String),

    #[error("Unknown timezone: {0}")]
    BadTimezone(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
