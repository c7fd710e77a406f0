use crate::config::ConfigValidationError;
use crate::identity::IdentityError;
use crate::store::StoreError;
use thiserror::Error;

/// Failures that prevent the bridge from starting. The subscriber is never
/// started when one of these occurs.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigValidationError),

    #[error("Failed to load TLS identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("Failed to initialize store: {0}")]
    Store(#[from] StoreError),
}
