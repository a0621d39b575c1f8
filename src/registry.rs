//! Resolver registry: one lazily started plugin per configured suffix

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::link::{Completion, ResolverLink};
use crate::protocol::PROTOCOL_VERSION;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Environment every plugin process is launched with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginEnv {
    state_location: PathBuf,
    options: String,
}

impl PluginEnv {
    pub fn new(state_location: impl Into<PathBuf>, options: impl Into<String>) -> Self {
        Self {
            state_location: state_location.into(),
            options: options.into(),
        }
    }

    pub fn options(&self) -> &str {
        &self.options
    }

    /// `TOR_NS_*` variables in launch order
    pub fn vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (
                "TOR_NS_STATE_LOCATION",
                self.state_location.to_string_lossy().into_owned(),
            ),
            ("TOR_NS_PROTO_VERSION", PROTOCOL_VERSION.to_string()),
            ("TOR_NS_PLUGIN_OPTIONS", self.options.clone()),
        ]
    }
}

/// Suffix → running plugin link
pub struct ResolverRegistry {
    config: Arc<BrokerConfig>,
    links: Mutex<HashMap<String, Arc<ResolverLink>>>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl ResolverRegistry {
    pub fn new(config: Arc<BrokerConfig>, completions: mpsc::UnboundedSender<Completion>) -> Self {
        Self {
            config,
            links: Mutex::new(HashMap::new()),
            completions,
        }
    }

    /// Longest configured suffix `s` such that `name` ends with `.s`
    pub fn suffix_for(&self, name: &str) -> Option<&str> {
        self.config
            .services
            .keys()
            .filter(|suffix| {
                name.len() > suffix.len()
                    && name.ends_with(suffix.as_str())
                    && name.as_bytes()[name.len() - suffix.len() - 1] == b'.'
            })
            .max_by_key(|suffix| suffix.len())
            .map(String::as_str)
    }

    /// Running link for `suffix`, launching (or relaunching a dead) plugin on demand
    pub async fn get_or_launch(&self, suffix: &str) -> Result<Arc<ResolverLink>> {
        let mut links = self.links.lock().await;

        if let Some(link) = links.get(suffix) {
            if link.is_connected() {
                return Ok(link.clone());
            }
            tracing::warn!(suffix = %suffix, "Plugin exited; relaunching");
            links.remove(suffix);
        }

        let service = self
            .config
            .services
            .get(suffix)
            .ok_or_else(|| BrokerError::NoService(suffix.to_string()))?;

        let link = Arc::new(ResolverLink::spawn(
            suffix,
            service,
            &self.config.plugin_env(suffix),
            self.config.retry_policy(),
            self.completions.clone(),
        )?);
        links.insert(suffix.to_string(), link.clone());
        Ok(link)
    }

    /// Link for `suffix` if one has been launched
    pub async fn link(&self, suffix: &str) -> Option<Arc<ResolverLink>> {
        self.links.lock().await.get(suffix).cloned()
    }

    /// Number of launched links, live or dead
    pub async fn len(&self) -> usize {
        self.links.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Kill every plugin process
    pub async fn shutdown(&self) {
        let links: Vec<Arc<ResolverLink>> = self.links.lock().await.drain().map(|(_, l)| l).collect();
        futures::future::join_all(links.iter().map(|link| link.close())).await;
        tracing::info!(count = links.len(), "Name service plugins stopped");
    }
}
