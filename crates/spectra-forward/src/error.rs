use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(transparent)]
    Gateway(#[from] spectra_gateway::GatewayError),

    #[error(transparent)]
    Store(#[from] spectra_store::StoreError),

    #[error(transparent)]
    Account(#[from] spectra_accounts::AccountError),

    #[error("No accounts configured for forwarding")]
    NoAccounts,

    #[error("Could not resolve destination: {0}")]
    DestinationUnresolved(String),
}

pub type Result<T> = std::result::Result<T, ForwardError>;
