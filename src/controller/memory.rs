//! In-memory controller for tests and dry runs
//!
//! Records every command instead of sending it anywhere, and pairs with
//! [`event_channel`] for a scripted event feed.

use super::{Controller, ControllerEvent, ControllerEvents};
use crate::error::{BrokerError, Result};
use crate::types::CloseReason;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// A command as the controller would have received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerCommand {
    Attach {
        stream_id: String,
        circuit_id: u64,
    },
    Close {
        stream_id: String,
        reason: CloseReason,
    },
    Redirect {
        stream_id: String,
        address: String,
    },
}

/// Recording controller
#[derive(Default)]
pub struct MemoryController {
    commands: Mutex<Vec<ControllerCommand>>,
    changed: Notify,
    reject_attach: AtomicBool,
}

impl MemoryController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every ATTACH with a rejection, as for a vanished stream
    pub fn rejecting_attach() -> Self {
        let controller = Self::default();
        controller.reject_attach.store(true, Ordering::SeqCst);
        controller
    }

    /// Snapshot of recorded commands, oldest first
    pub fn commands(&self) -> Vec<ControllerCommand> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Wait until at least `count` commands have been recorded
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Result<Vec<ControllerCommand>> {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                let commands = self.commands();
                if commands.len() >= count {
                    return commands;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            BrokerError::Timeout(format!(
                "expected {} controller commands, saw {:?}",
                count,
                self.commands()
            ))
        })
    }

    fn record(&self, command: ControllerCommand) {
        tracing::debug!(command = ?command, "Controller command");
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command);
        }
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl Controller for MemoryController {
    async fn attach_stream(&self, stream_id: &str, circuit_id: u64) -> Result<()> {
        self.record(ControllerCommand::Attach {
            stream_id: stream_id.to_string(),
            circuit_id,
        });
        if self.reject_attach.load(Ordering::SeqCst) {
            return Err(BrokerError::ControllerRejected(format!(
                "Unknown stream \"{}\"",
                stream_id
            )));
        }
        Ok(())
    }

    async fn close_stream(&self, stream_id: &str, reason: CloseReason) -> Result<()> {
        self.record(ControllerCommand::Close {
            stream_id: stream_id.to_string(),
            reason,
        });
        Ok(())
    }

    async fn redirect_stream(&self, stream_id: &str, address: &str) -> Result<()> {
        self.record(ControllerCommand::Redirect {
            stream_id: stream_id.to_string(),
            address: address.to_string(),
        });
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Scripted event feed; dropping the sender ends the feed with `Closed`
pub struct MemoryEvents {
    rx: mpsc::UnboundedReceiver<ControllerEvent>,
    closed: bool,
}

/// Create a sender and the matching [`ControllerEvents`] feed
pub fn event_channel() -> (mpsc::UnboundedSender<ControllerEvent>, MemoryEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, MemoryEvents { rx, closed: false })
}

#[async_trait]
impl ControllerEvents for MemoryEvents {
    async fn next(&mut self) -> Result<Option<ControllerEvent>> {
        if self.closed {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(ControllerEvent::Closed) | None => {
                self.closed = true;
                Ok(Some(ControllerEvent::Closed))
            }
            Some(event) => Ok(Some(event)),
        }
    }
}
