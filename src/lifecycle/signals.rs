//! OS signal handling.
//!
//! # Responsibilities
//! - Wait for the first stop signal
//! - Map it to a stop mode
//!
//! # Design Decisions
//! - SIGTERM asks for a graceful stop: orchestrators send it and then wait
//! - SIGINT stops immediately
//! - Platforms without SIGTERM only get Ctrl-C, treated as immediate

use std::fmt;

/// How the process was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Graceful,
    Immediate,
}

impl StopSignal {
    pub fn is_graceful(&self) -> bool {
        matches!(self, StopSignal::Graceful)
    }
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopSignal::Graceful => f.write_str("graceful"),
            StopSignal::Immediate => f.write_str("immediate"),
        }
    }
}

/// Wait for SIGTERM or SIGINT.
#[cfg(unix)]
pub async fn wait_for_stop() -> std::io::Result<StopSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    let received = tokio::select! {
        _ = term.recv() => StopSignal::Graceful,
        _ = int.recv() => StopSignal::Immediate,
    };
    tracing::info!(mode = %received, "Stop signal received");
    Ok(received)
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
pub async fn wait_for_stop() -> std::io::Result<StopSignal> {
    tokio::signal::ctrl_c().await?;
    tracing::info!(mode = %StopSignal::Immediate, "Stop signal received");
    Ok(StopSignal::Immediate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graceful_only_for_terminate() {
        assert!(StopSignal::Graceful.is_graceful());
        assert!(!StopSignal::Immediate.is_graceful());
        assert_eq!(StopSignal::Graceful.to_string(), "graceful");
    }
}
