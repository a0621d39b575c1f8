//! Stream attacher: turns stream events into controller commands
//!
//! For each stream waiting to be attached:
//!
//! 1. no configured suffix matches → attach unmodified
//! 2. plugin cannot be launched → close with `RESOLVEFAILED`
//! 3. otherwise classify the stream, submit the lookup, and finish
//!    asynchronously when the [`Completion`] arrives: redirect then attach on
//!    success, close on failure
//!
//! Streams that close while their lookup is in flight have the lookup
//! cancelled.

use crate::config::BrokerConfig;
use crate::controller::{Controller, ControllerEvent, ControllerEvents};
use crate::error::Result;
use crate::isolation::IsolationClassifier;
use crate::lifecycle::{BootstrapMonitor, LifecycleHooks};
use crate::link::{Completion, ResolverLink};
use crate::registry::ResolverRegistry;
use crate::types::{CloseReason, StreamEvent, StreamPurpose, StreamStatus, TorVersion};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Epoch assumed when the controller reports none
const DEFAULT_EPOCH: &str = "1";

/// How streams awaiting attachment are recognised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachFilter {
    /// Controller reports `CONTROLLER_WAIT` explicitly
    ControllerWait,
    /// `NEW`/`NEWRESOLVE` streams with a user or DNS purpose
    Legacy,
}

impl AttachFilter {
    /// Strategy for a controller of `version`
    pub fn for_version(version: &TorVersion) -> Self {
        if version.supports_controller_wait() {
            Self::ControllerWait
        } else {
            Self::Legacy
        }
    }

    /// Whether `event` is a stream waiting for the broker to attach it
    pub fn accepts(&self, event: &StreamEvent) -> bool {
        match self {
            Self::ControllerWait => event.status == StreamStatus::ControllerWait,
            Self::Legacy => {
                matches!(event.status, StreamStatus::New | StreamStatus::NewResolve)
                    && matches!(
                        event.purpose,
                        Some(StreamPurpose::User) | Some(StreamPurpose::DnsRequest)
                    )
            }
        }
    }
}

/// In-flight lookup for a stream, bound to the link that runs it
struct InFlight {
    link: Arc<ResolverLink>,
    query_id: u64,
}

impl InFlight {
    fn matches(&self, completion: &Completion) -> bool {
        self.link.id() == completion.link_id && self.query_id == completion.query_id
    }
}

/// Orchestrates registry, classifier and controller
pub struct StreamAttacher {
    controller: Arc<dyn Controller>,
    registry: ResolverRegistry,
    classifier: Mutex<IsolationClassifier>,
    isolation_prefix: String,
    filter: AttachFilter,
    in_flight: Mutex<HashMap<String, InFlight>>,
    completions: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Completion>>>,
}

impl StreamAttacher {
    /// Build an attacher with its own registry; plugins start on first use
    pub fn new(controller: Arc<dyn Controller>, config: Arc<BrokerConfig>, filter: AttachFilter) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let isolation_prefix = uuid::Uuid::new_v4().simple().to_string();

        tracing::info!(
            controller = controller.name(),
            filter = ?filter,
            services = config.services.len(),
            "Stream attacher ready"
        );

        Self {
            controller,
            registry: ResolverRegistry::new(config, tx),
            classifier: Mutex::new(IsolationClassifier::new()),
            isolation_prefix,
            filter,
            in_flight: Mutex::new(HashMap::new()),
            completions: std::sync::Mutex::new(Some(rx)),
        }
    }

    /// Registry of plugin links
    pub fn registry(&self) -> &ResolverRegistry {
        &self.registry
    }

    /// Strategy used to pick streams awaiting attachment
    pub fn filter(&self) -> AttachFilter {
        self.filter
    }

    /// Random per-process prefix of every isolation token
    pub fn isolation_prefix(&self) -> &str {
        &self.isolation_prefix
    }

    /// Token sent to plugins for lookups on `circuit_id`
    pub fn isolation_token(&self, circuit_id: u64) -> String {
        format!("{}-{}", self.isolation_prefix, circuit_id)
    }

    /// Streams with a lookup in flight
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// React to one stream lifecycle event
    ///
    /// Only controller failures other than rejections are returned.
    pub async fn handle_stream_event(&self, event: &StreamEvent) -> Result<()> {
        if event.status.is_terminal() {
            self.cancel_in_flight(&event.id).await;
            return Ok(());
        }
        if !self.filter.accepts(event) {
            return Ok(());
        }

        let name = event.target_address.as_str();
        let Some(suffix) = self.registry.suffix_for(name).map(str::to_string) else {
            tracing::debug!(stream_id = %event.id, target = %name, "No name service; attaching unmodified");
            return self.attach(&event.id).await;
        };

        let link = match self.registry.get_or_launch(&suffix).await {
            Ok(link) => link,
            Err(e) => {
                tracing::error!(stream_id = %event.id, suffix = %suffix, error = %e, "Name service unavailable");
                return self.close(&event.id).await;
            }
        };

        let epoch = event.nym_epoch().unwrap_or_else(|| {
            tracing::warn!("Stream event lacks NYM_EPOCH; assuming a single epoch");
            DEFAULT_EPOCH
        });
        let circuit_id = self
            .classifier
            .lock()
            .await
            .classify(epoch, event.isolation_attributes());
        let token = self.isolation_token(circuit_id);

        // Held across submit so a fast completion cannot race the insert
        let mut in_flight = self.in_flight.lock().await;
        match link.submit(&event.id, name, &token).await {
            Ok(query_id) => {
                tracing::info!(
                    stream_id = %event.id,
                    suffix = %suffix,
                    query_id,
                    circuit = circuit_id,
                    "Resolving"
                );
                // Lookups on dead plugins were abandoned with them
                in_flight.retain(|_, f| f.link.is_connected());
                in_flight.insert(event.id.clone(), InFlight { link, query_id });
                Ok(())
            }
            Err(e) => {
                drop(in_flight);
                tracing::error!(stream_id = %event.id, suffix = %suffix, error = %e, "Lookup submission failed");
                self.close(&event.id).await
            }
        }
    }

    /// Apply a lookup outcome to its stream
    ///
    /// Outcomes for streams that closed, or whose lookup was superseded,
    /// are dropped.
    pub async fn complete(&self, completion: Completion) -> Result<()> {
        {
            let mut in_flight = self.in_flight.lock().await;
            let owned = in_flight
                .get(&completion.stream_id)
                .is_some_and(|f| f.matches(&completion));
            if !owned {
                tracing::debug!(
                    stream_id = %completion.stream_id,
                    suffix = %completion.suffix,
                    query_id = completion.query_id,
                    "Dropping outcome for a stream no longer waiting on it"
                );
                return Ok(());
            }
            in_flight.remove(&completion.stream_id);
        }

        let stream_id = completion.stream_id;
        match completion.outcome.into_result() {
            Ok(address) => {
                tracing::info!(
                    stream_id = %stream_id,
                    suffix = %completion.suffix,
                    address = %address,
                    "Resolved; redirecting"
                );
                match self.controller.redirect_stream(&stream_id, &address).await {
                    Ok(()) => self.attach(&stream_id).await,
                    Err(e) if e.is_rejection() => {
                        tracing::debug!(stream_id = %stream_id, error = %e, "Redirect rejected; stream gone");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => {
                tracing::warn!(
                    stream_id = %stream_id,
                    suffix = %completion.suffix,
                    error = %e,
                    "Closing stream"
                );
                self.close(&stream_id).await
            }
        }
    }

    /// Process completions until the attacher is dropped
    ///
    /// Returns `None` if the loop has already been started.
    pub fn spawn_completion_loop(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.completions.lock().ok()?.take()?;
        let attacher = Arc::clone(self);
        Some(tokio::spawn(async move {
            while let Some(completion) = rx.recv().await {
                let stream_id = completion.stream_id.clone();
                if let Err(e) = attacher.complete(completion).await {
                    tracing::error!(stream_id = %stream_id, error = %e, "Failed to apply lookup outcome");
                }
            }
        }))
    }

    /// Dispatch controller events until the control connection is gone
    ///
    /// A failed read counts as a lost connection; the controller-lost
    /// hooks run either way.
    pub async fn serve<E>(&self, events: &mut E, monitor: &BootstrapMonitor, hooks: &LifecycleHooks)
    where
        E: ControllerEvents + ?Sized,
    {
        loop {
            match events.next().await {
                Ok(Some(ControllerEvent::Stream(stream))) => {
                    if let Err(e) = self.handle_stream_event(&stream).await {
                        tracing::error!(stream_id = %stream.id, error = %e, "Failed to handle stream");
                    }
                }
                Ok(Some(ControllerEvent::Bootstrap(status))) => {
                    monitor.observe(&status);
                }
                Ok(Some(ControllerEvent::Closed)) | Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Control connection failed");
                    break;
                }
            }
        }
        hooks.run_controller_lost();
    }

    /// Stop every plugin process
    pub async fn shutdown(&self) {
        self.in_flight.lock().await.clear();
        self.registry.shutdown().await;
    }

    async fn cancel_in_flight(&self, stream_id: &str) {
        let Some(entry) = self.in_flight.lock().await.remove(stream_id) else {
            return;
        };
        if entry.link.cancel(entry.query_id).await {
            tracing::info!(
                stream_id = %stream_id,
                suffix = %entry.link.suffix(),
                query_id = entry.query_id,
                "Stream closed; lookup cancelled"
            );
        }
    }

    async fn attach(&self, stream_id: &str) -> Result<()> {
        match self.controller.attach_stream(stream_id, 0).await {
            Err(e) if e.is_rejection() => {
                tracing::debug!(stream_id = %stream_id, error = %e, "Attach rejected; stream gone");
                Ok(())
            }
            other => other,
        }
    }

    async fn close(&self, stream_id: &str) -> Result<()> {
        match self
            .controller
            .close_stream(stream_id, CloseReason::ResolveFailed)
            .await
        {
            Err(e) if e.is_rejection() => {
                tracing::debug!(stream_id = %stream_id, error = %e, "Close rejected; stream gone");
                Ok(())
            }
            other => other,
        }
    }
}
