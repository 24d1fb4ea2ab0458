//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the store backend, secret box and routing table from config
//! - Start the configurator and wait for a stop signal or a sync failure
//! - Stop everything in the mode the signal asks for
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - The initial topology is applied before the process waits on signals

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::{BackendKind, ControlConfig, SecretsConfig, StoreConfig};
use crate::lifecycle::signals;
use crate::secret::{Key, SecretBox, SecretError};
use crate::server::RoutingTable;
use crate::store::{EtcdBackend, KvBackend, MemoryBackend, StoreError};
use crate::sync::{Configurator, SyncError, SyncOptions};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to create store backend: {0}")]
    Store(#[from] StoreError),

    #[error("invalid secrets configuration: {0}")]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("failed to install signal handlers: {0}")]
    Signal(#[from] std::io::Error),
}

/// Create the configured key-value backend.
pub fn build_backend(config: &StoreConfig) -> Result<Arc<dyn KvBackend>, StartupError> {
    match config.backend {
        BackendKind::Etcd => {
            let backend = EtcdBackend::new(config)?;
            tracing::info!(
                endpoints = ?config.endpoints,
                consistency = ?config.consistency,
                "Using etcd store backend"
            );
            Ok(Arc::new(backend))
        }
        BackendKind::Memory => {
            tracing::warn!("Using in-memory store backend, topology will not persist");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}

/// Create the secret box, if a key is configured.
pub fn build_secrets(config: &SecretsConfig) -> Result<Option<Arc<SecretBox>>, StartupError> {
    let Some(hex_key) = config.box_key.as_deref() else {
        tracing::info!("No box key configured, sealed values cannot be read");
        return Ok(None);
    };
    let secrets = SecretBox::new(&Key::from_hex(hex_key)?);
    tracing::info!(key_id = secrets.key_id(), "Secret box ready");
    Ok(Some(Arc::new(secrets)))
}

/// Error that ended the change loop. Pending forever if the loop never fails.
async fn loop_failure(failures: Option<oneshot::Receiver<SyncError>>) -> SyncError {
    if let Some(rx) = failures {
        if let Ok(error) = rx.await {
            return error;
        }
    }
    std::future::pending().await
}

/// Run the control plane until a stop signal or a fatal sync error.
pub async fn run(config: ControlConfig) -> Result<(), StartupError> {
    tracing::info!(
        root = %config.store.root,
        backend = ?config.store.backend,
        interface = %config.server.interface,
        port = config.server.port,
        "Starting proxy control plane"
    );

    let backend = build_backend(&config.store)?;
    let secrets = build_secrets(&config.secrets)?;
    let table = Arc::new(RoutingTable::new(&config.server));

    let mut configurator = Configurator::new(
        backend,
        table.clone(),
        SyncOptions::from_config(&config, secrets),
    );
    configurator.start().await?;

    let snapshot = table.snapshot();
    tracing::info!(
        version = snapshot.version,
        entities = snapshot.topology.entity_count(),
        "Initial topology applied, watching for changes"
    );

    let failures = configurator.failures();
    tokio::select! {
        signal = signals::wait_for_stop() => {
            let signal = signal?;
            configurator.stop(signal.is_graceful()).await?;
            tracing::info!(mode = %signal, "Shutdown complete");
            Ok(())
        }
        error = loop_failure(failures) => {
            tracing::error!(error = %error, "Synchronization failed, stopping");
            configurator.stop(false).await?;
            Err(StartupError::Sync(error))
        }
    }
}
