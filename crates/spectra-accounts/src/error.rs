use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("No account available for rotation")]
    NoAccountAvailable,

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error(transparent)]
    Store(#[from] spectra_store::StoreError),
}

pub type Result<T> = std::result::Result<T, AccountError>;
