//! Proxy control plane.
//!
//! # Architecture Overview
//!
//! ```text
//!     etcd v2 (/proxy/...)                 ┌──────────────────────────────┐
//!     ───────────────────────┐             │        CONTROL PLANE         │
//!                            │             │                              │
//!         full read          ▼             │  ┌────────────┐              │
//!     ─────────────▶ ┌──────────────┐      │  │ topology   │              │
//!                    │ hierarchical │──────┼─▶│ decode     │              │
//!         changes    │    store     │      │  └─────┬──────┘              │
//!     ─────────────▶ └──────────────┘      │        ▼                     │
//!                                          │  ┌────────────┐  ┌────────┐  │
//!                                          │  │ reconciler │─▶│ server │  │
//!                                          │  └────────────┘  └────────┘  │
//!                                          │                              │
//!                                          │  config · lifecycle · logs   │
//!                                          └──────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use proxy_control::config::{load_config, ControlConfig};
use proxy_control::lifecycle;
use proxy_control::observability::{logging, metrics};

#[derive(Parser, Debug)]
#[command(name = "proxy-control", version, about = "Reverse proxy control plane")]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration file.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ControlConfig::default(),
    };

    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.observability.log_level);
    logging::init_logging(level);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "proxy-control starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(e) => {
                tracing::error!(
                    metrics_address = %config.observability.metrics_address,
                    error = %e,
                    "Failed to parse metrics address"
                );
            }
        }
    }

    lifecycle::run(config).await?;
    Ok(())
}
