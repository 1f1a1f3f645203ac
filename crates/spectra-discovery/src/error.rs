use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Fleet(#[from] spectra_fleet::FleetError),

    #[error(transparent)]
    Gateway(#[from] spectra_gateway::GatewayError),

    #[error(transparent)]
    Store(#[from] spectra_store::StoreError),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
