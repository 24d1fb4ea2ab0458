//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     ControlConfig → store backend → secret box → routing table
//!         → Configurator::start (initial load, change loop)
//!
//! Run:
//!     select { OS stop signal, change loop failure }
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     SIGTERM → graceful stop (finish event, drain connections)
//!     SIGINT  → immediate stop
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then store, then server, then sync
//! - A change loop failure ends the process the same way as an immediate stop
//! - Draining is bounded by the server's drain timeout

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::StopSignal;
pub use startup::{run, StartupError};
