use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Gateway(#[from] spectra_gateway::GatewayError),

    #[error(transparent)]
    Store(#[from] spectra_store::StoreError),

    #[error("Download log error: {0}")]
    DownloadLog(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
