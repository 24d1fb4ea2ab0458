//! Configurator error type.

use thiserror::Error;

use crate::server::ServerError;
use crate::store::StoreError;
use crate::sync::ConfiguratorState;

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("configurator is {actual}, expected {expected}")]
    InvalidState {
        expected: ConfiguratorState,
        actual: ConfiguratorState,
    },

    #[error("change loop aborted: {0}")]
    LoopAborted(String),
}
