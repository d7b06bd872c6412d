use thiserror::Error;

use crate::flows::{BindError, ResolveError};
use crate::gateway::GatewayError;
use crate::storage::StoreError;

/// Every way a flow operation can fail.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("No flow found for {0}")]
    NotFound(String),

    #[error("Flow parameters must be a JSON object: {0}")]
    MalformedParameters(String),
}
