//! Resolver link
//!
//! Multiplexes any number of concurrent lookups over one plugin's
//! stdin/stdout pair. Submissions return the query id immediately;
//! outcomes arrive later as [`Completion`]s on the channel the link was
//! built with.
//!
//! Tasks per link:
//! - writer: drains the outgoing line queue into the plugin's stdin
//! - reader: parses plugin stdout and settles pending queries
//! - stderr drain: re-emits plugin diagnostics (process-backed links only)
//! - one deadline timer per query, one short-lived task per scheduled retry

use crate::config::ServiceCommand;
use crate::error::{BrokerError, Result};
use crate::protocol::{PluginRequest, PluginResponse, PROTOCOL_MAJOR};
use crate::registry::PluginEnv;
use crate::types::ResolveStatus;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

/// Deadline window and backoff applied to every query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Time after submission during which retryable failures are retried
    pub window: Duration,
    /// Delay before resending a query after a retryable failure
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            backoff: Duration::from_secs(1),
        }
    }
}

/// Terminal result of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// First token of a successful answer
    Resolved(String),
    Failed(ResolveStatus),
}

impl Outcome {
    /// The resolved address, or the terminal status as an error
    pub fn into_result(self) -> Result<String> {
        match self {
            Self::Resolved(address) => Ok(address),
            Self::Failed(status) => Err(BrokerError::Resolution(status)),
        }
    }
}

/// Delivered once per query that reaches a terminal outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub suffix: String,
    /// [`ResolverLink::id`] of the link that ran the query
    pub link_id: u64,
    pub query_id: u64,
    pub stream_id: String,
    pub outcome: Outcome,
}

#[derive(Debug)]
struct Query {
    stream_id: String,
    name: String,
    isolation_token: String,
    deadline: Instant,
    /// A resend is already queued; further retryable replies are ignored
    retry_scheduled: bool,
}

impl Query {
    fn request(&self, query_id: u64) -> PluginRequest {
        PluginRequest::Resolve {
            query_id,
            name: self.name.clone(),
            isolation_token: self.isolation_token.clone(),
        }
    }
}

/// Process-wide link counter; query ids restart at 1 per link
static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// State shared between the link handle and its tasks
struct Shared {
    suffix: String,
    link_id: u64,
    policy: RetryPolicy,
    pending: Mutex<HashMap<u64, Query>>,
    outgoing: mpsc::UnboundedSender<String>,
    completions: mpsc::UnboundedSender<Completion>,
    connected: AtomicBool,
    version: OnceLock<(u32, u32)>,
}

/// One plugin process and its query table
pub struct ResolverLink {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    child: Mutex<Option<Child>>,
}

impl ResolverLink {
    /// Spawn the plugin process for `suffix` and start its reader tasks
    pub fn spawn(
        suffix: &str,
        service: &ServiceCommand,
        env: &PluginEnv,
        policy: RetryPolicy,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> Result<Self> {
        let mut cmd = Command::new(&service.command);
        cmd.args(&service.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(env.vars())
            .kill_on_drop(true);

        let launch_err = |reason: String| BrokerError::PluginLaunch {
            suffix: suffix.to_string(),
            reason,
        };

        let mut child = cmd
            .spawn()
            .map_err(|e| launch_err(format!("{} {:?}: {}", service.command, service.args, e)))?;

        let stdin = child.stdin.take().ok_or_else(|| launch_err("no stdin".to_string()))?;
        let stdout = child.stdout.take().ok_or_else(|| launch_err("no stdout".to_string()))?;
        let stderr = child.stderr.take().ok_or_else(|| launch_err("no stderr".to_string()))?;

        tracing::info!(
            suffix = %suffix,
            command = %service.command,
            pid = ?child.id(),
            "Launched name service plugin"
        );

        let mut link = Self::from_io(suffix, stdout, stdin, policy, completions);
        link.drain_stderr(stderr);
        link.child = Mutex::new(Some(child));
        Ok(link)
    }

    /// Build a link over an arbitrary duplex byte stream
    ///
    /// Must be called within a tokio runtime.
    pub fn from_io<R, W>(
        suffix: &str,
        reader: R,
        writer: W,
        policy: RetryPolicy,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            suffix: suffix.to_string(),
            link_id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            policy,
            pending: Mutex::new(HashMap::new()),
            outgoing,
            completions,
            connected: AtomicBool::new(true),
            version: OnceLock::new(),
        });

        tokio::spawn(write_loop(shared.clone(), writer, outgoing_rx));
        tokio::spawn(read_loop(shared.clone(), reader));

        Self {
            shared,
            next_id: AtomicU64::new(1),
            child: Mutex::new(None),
        }
    }

    fn drain_stderr<E>(&self, stderr: E)
    where
        E: AsyncRead + Unpin + Send + 'static,
    {
        let suffix = self.shared.suffix.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(suffix = %suffix, "plugin: {}", line);
            }
        });
    }

    /// Record a query and send its `RESOLVE` line; the outcome arrives as a [`Completion`]
    pub async fn submit(
        &self,
        stream_id: &str,
        name: &str,
        isolation_token: &str,
    ) -> Result<u64> {
        if !self.is_connected() {
            return Err(BrokerError::LinkClosed(self.shared.suffix.clone()));
        }

        let query_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = PluginRequest::resolve(query_id, name, isolation_token)?.to_string();
        let deadline = Instant::now() + self.shared.policy.window;

        // Insert before writing so a fast response always finds its query
        self.shared.pending.lock().await.insert(
            query_id,
            Query {
                stream_id: stream_id.to_string(),
                name: name.to_string(),
                isolation_token: isolation_token.to_string(),
                deadline,
                retry_scheduled: false,
            },
        );

        if self.shared.outgoing.send(line).is_err() {
            self.shared.pending.lock().await.remove(&query_id);
            self.shared.connected.store(false, Ordering::SeqCst);
            return Err(BrokerError::LinkClosed(self.shared.suffix.clone()));
        }

        tracing::debug!(
            suffix = %self.shared.suffix,
            query_id,
            stream_id = %stream_id,
            name = %name,
            "Lookup submitted"
        );

        tokio::spawn(expire_at(self.shared.clone(), query_id, deadline));
        Ok(query_id)
    }

    /// Drop a pending query and tell the plugin; returns false if it had already settled
    pub async fn cancel(&self, query_id: u64) -> bool {
        let removed = self.shared.pending.lock().await.remove(&query_id);
        if removed.is_none() {
            return false;
        }
        tracing::debug!(suffix = %self.shared.suffix, query_id, "Cancelling lookup");
        let _ = self
            .shared
            .outgoing
            .send(PluginRequest::Cancel { query_id }.to_string());
        true
    }

    /// Unique per link; a relaunched plugin gets a new id
    pub fn id(&self) -> u64 {
        self.shared.link_id
    }

    /// Suffix this link serves
    pub fn suffix(&self) -> &str {
        &self.shared.suffix
    }

    /// Whether the plugin's pipes are still open
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Number of queries awaiting a terminal outcome
    pub async fn pending_count(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    /// Protocol version from the plugin's `INIT` line, once received
    pub fn protocol_version(&self) -> Option<(u32, u32)> {
        self.shared.version.get().copied()
    }

    /// Abandon pending queries and kill the plugin process
    pub async fn close(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.pending.lock().await.clear();
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
    }
}

async fn write_loop<W>(shared: Arc<Shared>, mut writer: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::error!(suffix = %shared.suffix, error = %e, "Failed to write to plugin");
            shared.connected.store(false, Ordering::SeqCst);
            return;
        }
    }
}

async fn read_loop<R>(shared: Arc<Shared>, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => shared.handle_line(&line).await,
            Ok(None) => {
                tracing::warn!(suffix = %shared.suffix, "Plugin output closed");
                break;
            }
            Err(e) => {
                tracing::error!(suffix = %shared.suffix, error = %e, "Failed to read plugin output");
                break;
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    let abandoned = {
        let mut pending = shared.pending.lock().await;
        let n = pending.len();
        pending.clear();
        n
    };
    if abandoned > 0 {
        tracing::warn!(suffix = %shared.suffix, abandoned, "Abandoned pending lookups");
    }
}

async fn expire_at(shared: Arc<Shared>, query_id: u64, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
    let expired = shared.pending.lock().await.remove(&query_id);
    if let Some(query) = expired {
        tracing::warn!(
            suffix = %shared.suffix,
            query_id,
            name = %query.name,
            "Lookup deadline passed"
        );
        shared.complete(query_id, query.stream_id, Outcome::Failed(ResolveStatus::Timeout));
    }
}

impl Shared {
    async fn handle_line(self: &Arc<Self>, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match line.parse::<PluginResponse>() {
            Ok(PluginResponse::Init { major, minor }) => {
                let _ = self.version.set((major, minor));
                if major != PROTOCOL_MAJOR {
                    tracing::warn!(
                        suffix = %self.suffix,
                        major,
                        minor,
                        "Plugin speaks an unsupported protocol version"
                    );
                } else {
                    tracing::info!(suffix = %self.suffix, major, minor, "Plugin initialized");
                }
            }
            Ok(response @ PluginResponse::Resolved { .. }) => self.on_resolved(response).await,
            Ok(PluginResponse::Canceled { query_id }) => {
                tracing::debug!(suffix = %self.suffix, query_id, "Plugin confirmed cancel");
            }
            Err(e) => {
                tracing::warn!(suffix = %self.suffix, error = %e, "Ignoring plugin line");
            }
        }
    }

    async fn on_resolved(self: &Arc<Self>, response: PluginResponse) {
        let PluginResponse::Resolved { query_id, status, .. } = response else {
            return;
        };
        let mut pending = self.pending.lock().await;
        let outstanding = pending.len();

        let Some(query) = pending.get_mut(&query_id) else {
            tracing::warn!(
                suffix = %self.suffix,
                query_id,
                outstanding,
                "No pending query for response"
            );
            return;
        };

        if status.is_retryable() && Instant::now() < query.deadline {
            if query.retry_scheduled {
                tracing::debug!(suffix = %self.suffix, query_id, "Retry already scheduled");
                return;
            }
            query.retry_scheduled = true;
            drop(pending);
            tracing::debug!(suffix = %self.suffix, query_id, status = %status, "Retrying lookup");
            tokio::spawn(resend_after(self.clone(), query_id));
            return;
        }

        let Some(query) = pending.remove(&query_id) else {
            return;
        };
        drop(pending);

        let outcome = match (status, response.resolved_value()) {
            (ResolveStatus::Success, Some(value)) => Outcome::Resolved(value.to_string()),
            (ResolveStatus::Success, None) => {
                tracing::warn!(suffix = %self.suffix, query_id, "Successful response without an answer");
                Outcome::Failed(ResolveStatus::GenericFailure)
            }
            (failure, _) => Outcome::Failed(failure),
        };
        self.complete(query_id, query.stream_id, outcome);
    }

    fn complete(&self, query_id: u64, stream_id: String, outcome: Outcome) {
        let completion = Completion {
            suffix: self.suffix.clone(),
            link_id: self.link_id,
            query_id,
            stream_id,
            outcome,
        };
        if self.completions.send(completion).is_err() {
            tracing::debug!(suffix = %self.suffix, query_id, "Completion receiver dropped");
        }
    }
}

async fn resend_after(shared: Arc<Shared>, query_id: u64) {
    tokio::time::sleep(shared.policy.backoff).await;
    let line = match shared.pending.lock().await.get_mut(&query_id) {
        Some(query) => {
            query.retry_scheduled = false;
            query.request(query_id).to_string()
        }
        None => return,
    };
    let _ = shared.outgoing.send(line);
}
