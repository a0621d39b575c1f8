//! Controller trait, the seam between the broker and the network daemon
//!
//! The broker only needs three commands (attach, close, redirect) and a
//! feed of lifecycle events. Backends implement [`Controller`] for the
//! commands and [`ControllerEvents`] for the feed.

use crate::error::Result;
use crate::types::{BootstrapStatus, CloseReason, StreamEvent};
use async_trait::async_trait;

pub mod memory;
pub mod tor;

/// Commands the broker issues against streams
#[async_trait]
pub trait Controller: Send + Sync {
    /// Attach a stream to `circuit_id`, or let the daemon choose with `0`
    ///
    /// Returns `BrokerError::ControllerRejected` when the stream is gone
    /// or the request is unsatisfiable.
    async fn attach_stream(&self, stream_id: &str, circuit_id: u64) -> Result<()>;

    /// Close a stream with the given relay end reason
    async fn close_stream(&self, stream_id: &str, reason: CloseReason) -> Result<()>;

    /// Rewrite a stream's destination address
    async fn redirect_stream(&self, stream_id: &str, address: &str) -> Result<()>;

    /// Backend name (e.g., "tor", "memory")
    fn name(&self) -> &str;
}

/// Something the controller reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    Stream(StreamEvent),
    Bootstrap(BootstrapStatus),
    /// The control connection is gone; delivered once
    Closed,
}

/// Async feed of controller events
#[async_trait]
pub trait ControllerEvents: Send {
    /// Next event, or `None` after `Closed` has been delivered
    async fn next(&mut self) -> Result<Option<ControllerEvent>>;
}
