use thiserror::Error;

use spectra_gateway::GatewayError;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Account(#[from] spectra_accounts::AccountError),

    #[error(transparent)]
    Store(#[from] spectra_store::StoreError),

    #[error("No gateway connected for account: {0}")]
    NoGateway(String),

    #[error("Could not resolve destination: {0}")]
    DestinationUnresolved(String),

    #[error("Task failed: {0}")]
    Task(String),
}

impl FleetError {
    /// Error class string recorded on task rows and in result maps.
    pub fn kind(&self) -> &'static str {
        match self {
            FleetError::Gateway(e) => e.kind(),
            FleetError::Account(_) => "NO_ACCOUNT_AVAILABLE",
            FleetError::Store(_) => "STORE_ERROR",
            FleetError::NoGateway(_) => "NO_GATEWAY",
            FleetError::DestinationUnresolved(_) => "DESTINATION_UNRESOLVED",
            FleetError::Task(_) => "TASK_ERROR",
        }
    }

    /// Flood-class failures cool the bound account for an hour when the
    /// scheduler records the completion.
    pub fn is_flood_class(&self) -> bool {
        matches!(self, FleetError::Gateway(e) if e.flood_wait_seconds().is_some())
    }

    pub fn as_gateway(&self) -> Option<&GatewayError> {
        match self {
            FleetError::Gateway(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
