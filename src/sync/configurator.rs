//! Configurator: initial load, change loop and stop.
//!
//! # Responsibilities
//! - Apply the full namespace once, then follow it from the observed index
//! - Run the change loop on its own task and surface its fatal error
//! - Stop gracefully (finish the current event, drain the server) or at once

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::config::ControlConfig;
use crate::lifecycle::shutdown::Shutdown;
use crate::resilience::RetryPolicy;
use crate::secret::SecretBox;
use crate::server::Server;
use crate::store::{ChangeFeed, KvBackend};
use crate::sync::{Reconciler, SyncError};
use crate::topology::{KeyLayout, MiddlewareRegistry, Topology};

/// Everything the configurator needs besides the backend and the server.
#[derive(Clone)]
pub struct SyncOptions {
    /// Namespace root all entity keys live under.
    pub root: String,
    /// Decrypts sealed values. Without it, sealed values fail to decode.
    pub secrets: Option<Arc<SecretBox>>,
    pub retry: RetryPolicy,
    pub registry: MiddlewareRegistry,
}

impl SyncOptions {
    pub fn from_config(config: &ControlConfig, secrets: Option<Arc<SecretBox>>) -> Self {
        Self {
            root: config.store.root.clone(),
            secrets,
            retry: RetryPolicy::from_config(&config.retries),
            registry: MiddlewareRegistry::default(),
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            root: "/proxy".to_string(),
            secrets: None,
            retry: RetryPolicy::default(),
            registry: MiddlewareRegistry::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfiguratorState {
    Created,
    Starting,
    Running,
    /// The change loop ended on a fatal error; the server is still up.
    Failed,
    Stopping,
    Stopped,
}

impl fmt::Display for ConfiguratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfiguratorState::Created => "created",
            ConfiguratorState::Starting => "starting",
            ConfiguratorState::Running => "running",
            ConfiguratorState::Failed => "failed",
            ConfiguratorState::Stopping => "stopping",
            ConfiguratorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

pub struct Configurator {
    backend: Arc<dyn KvBackend>,
    server: Arc<dyn Server>,
    options: SyncOptions,
    state: ConfiguratorState,
    published: Arc<ArcSwap<Topology>>,
    shutdown: Shutdown,
    task: Option<JoinHandle<()>>,
    failures: Option<oneshot::Receiver<SyncError>>,
}

impl Configurator {
    pub fn new(backend: Arc<dyn KvBackend>, server: Arc<dyn Server>, options: SyncOptions) -> Self {
        Self {
            backend,
            server,
            options,
            state: ConfiguratorState::Created,
            published: Arc::new(ArcSwap::from_pointee(Topology::new())),
            shutdown: Shutdown::new(),
            task: None,
            failures: None,
        }
    }

    pub fn state(&self) -> ConfiguratorState {
        match &self.task {
            // A loop that ends while Running ended on a fatal error.
            Some(task) if self.state == ConfiguratorState::Running && task.is_finished() => {
                ConfiguratorState::Failed
            }
            _ => self.state,
        }
    }

    /// Last published topology.
    pub fn topology(&self) -> Arc<Topology> {
        self.published.load_full()
    }

    /// Receiver for the error that ends the change loop. Available once,
    /// after a successful start.
    pub fn failures(&mut self) -> Option<oneshot::Receiver<SyncError>> {
        self.failures.take()
    }

    /// Apply the whole namespace, then start following changes.
    ///
    /// Returns once the initial topology is applied. A failure before that
    /// point leaves the configurator stopped.
    pub async fn start(&mut self) -> Result<(), SyncError> {
        if self.state != ConfiguratorState::Created {
            return Err(SyncError::InvalidState {
                expected: ConfiguratorState::Created,
                actual: self.state(),
            });
        }
        self.state = ConfiguratorState::Starting;

        let layout = KeyLayout::new(&self.options.root);
        let mut reconciler = Reconciler::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.server),
            layout.clone(),
            self.options.secrets.clone(),
            self.options.retry.clone(),
            self.options.registry.clone(),
            Arc::clone(&self.published),
        );

        let feed = match self.bootstrap(&mut reconciler, &layout).await {
            Ok(feed) => feed,
            Err(e) => {
                tracing::error!(error = %e, root = layout.root(), "Configurator failed to start");
                self.state = ConfiguratorState::Stopped;
                return Err(e);
            }
        };

        let (failure_tx, failure_rx) = oneshot::channel();
        let shutdown_rx = self.shutdown.subscribe();
        self.task = Some(tokio::spawn(change_loop(
            reconciler,
            feed,
            shutdown_rx,
            failure_tx,
        )));
        self.failures = Some(failure_rx);
        self.state = ConfiguratorState::Running;
        tracing::info!(root = layout.root(), "Configurator running");
        Ok(())
    }

    async fn bootstrap(
        &self,
        reconciler: &mut Reconciler,
        layout: &KeyLayout,
    ) -> Result<Box<dyn ChangeFeed>, SyncError> {
        let index = reconciler.load().await?;
        let feed = self.backend.watch(layout.root(), index).await?;
        Ok(feed)
    }

    /// Stop following changes and stop the server.
    ///
    /// Graceful: the event in progress completes, then the server drains.
    /// Immediate: the loop is cancelled and the server stops without draining.
    /// Stopping a stopped configurator does nothing.
    pub async fn stop(&mut self, graceful: bool) -> Result<(), SyncError> {
        match self.state() {
            ConfiguratorState::Stopped => return Ok(()),
            ConfiguratorState::Created => {
                self.state = ConfiguratorState::Stopped;
                return Ok(());
            }
            ConfiguratorState::Failed => {
                tracing::warn!("Stopping after the change loop failed");
            }
            ConfiguratorState::Running => {}
            actual => {
                return Err(SyncError::InvalidState {
                    expected: ConfiguratorState::Running,
                    actual,
                })
            }
        }
        self.state = ConfiguratorState::Stopping;
        tracing::info!(
            graceful,
            loop_subscribers = self.shutdown.receiver_count(),
            "Configurator stopping"
        );

        let joined = match self.task.take() {
            Some(task) if graceful => {
                self.shutdown.trigger();
                task.await.map_err(|e| SyncError::LoopAborted(e.to_string()))
            }
            Some(task) => {
                task.abort();
                // Cancellation is the expected outcome here.
                let _ = task.await;
                Ok(())
            }
            None => Ok(()),
        };

        self.server.stop(graceful).await;
        self.state = ConfiguratorState::Stopped;
        tracing::info!("Configurator stopped");
        joined
    }
}

impl Drop for Configurator {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Apply changes one at a time until shutdown or the first fatal error.
async fn change_loop(
    mut reconciler: Reconciler,
    mut feed: Box<dyn ChangeFeed>,
    mut shutdown: broadcast::Receiver<()>,
    failure: oneshot::Sender<SyncError>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                tracing::info!("Change loop received shutdown signal");
                return;
            }

            next = feed.next() => {
                let applied = match next {
                    Ok(change) => reconciler.handle(&change).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = applied {
                    tracing::error!(error = %e, "Change loop stopped on fatal error");
                    let _ = failure.send(e);
                    return;
                }
            }
        }
    }
}
