//! # torns
//!
//! Name-resolution broker for Tor streams.
//!
//! ## Overview
//!
//! `torns` watches the control port for streams waiting to be attached.
//! When a stream's destination ends in a configured suffix (e.g. `pet.onion`),
//! the name is handed to a resolver plugin (an external process speaking a
//! small line protocol over stdin/stdout) and the stream is redirected to
//! the answer, or closed if resolution fails. Everything else is attached
//! unmodified.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use torns::{AttachFilter, BrokerConfig, ServiceCommand, StreamAttacher};
//! use torns::controller::memory::MemoryController;
//!
//! # async fn example() -> torns::Result<()> {
//! let config = BrokerConfig::default().with_service(
//!     "pet.onion",
//!     ServiceCommand::new("torns-petname", vec![]),
//! );
//! let controller = Arc::new(MemoryController::new());
//! let attacher = Arc::new(StreamAttacher::new(
//!     controller,
//!     Arc::new(config),
//!     AttachFilter::ControllerWait,
//! ));
//! attacher.spawn_completion_loop();
//! # Ok(())
//! # }
//! ```
//!
//! ## Controllers
//!
//! - **tor** — control-port client over TCP
//! - **memory** — recording controller for tests and dry runs
//!
//! ## Architecture
//!
//! - **ResolverLink** — multiplexes concurrent lookups over one plugin process
//! - **ResolverRegistry** — suffix → lazily launched plugin
//! - **IsolationClassifier** — groups streams into isolation circuits per epoch
//! - **StreamAttacher** — turns stream events into attach/redirect/close commands
//! - **Controller** trait — the seam to the network daemon

pub mod attacher;
pub mod config;
pub mod controller;
pub mod error;
pub mod isolation;
pub mod lifecycle;
pub mod link;
pub mod protocol;
pub mod registry;
pub mod types;

// Re-export core types
pub use attacher::{AttachFilter, StreamAttacher};
pub use config::{BrokerConfig, HookCommand, ServiceCommand};
pub use controller::{Controller, ControllerEvent, ControllerEvents};
pub use error::{BrokerError, Result};
pub use isolation::{streams_compatible, IsolationAttributes, IsolationClassifier};
pub use lifecycle::{BootstrapMonitor, LifecycleHooks};
pub use link::{Completion, Outcome, ResolverLink, RetryPolicy};
pub use protocol::{PluginRequest, PluginResponse};
pub use registry::{PluginEnv, ResolverRegistry};
pub use types::{
    BootstrapStatus, CloseReason, ResolveStatus, StreamEvent, StreamPurpose, StreamStatus,
    TorVersion,
};

// Re-export controller backends for convenience
pub use controller::memory::{ControllerCommand, MemoryController};
pub use controller::tor::{TorClient, TorConfig, TorController, TorEvents};
