//! Broker configuration
//!
//! Built once at startup and handed to the registry and attacher. Loaded
//! from a single JSON file, or from a directory of JSON fragments merged
//! in filename order.

use crate::error::{BrokerError, Result};
use crate::link::RetryPolicy;
use crate::registry::PluginEnv;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A plugin launch command for one suffix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCommand {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Passed to the plugin as `TOR_NS_PLUGIN_OPTIONS`
    #[serde(default)]
    pub options: String,
}

impl ServiceCommand {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            options: String::new(),
        }
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = options.into();
        self
    }
}

/// A command run when a lifecycle hook fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookCommand {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,
}

/// Top-level broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    /// Control port address (`host:port`)
    #[serde(default = "default_control_address")]
    pub control_address: String,

    #[serde(default)]
    pub control_password: Option<String>,

    /// Cookie file for `AUTHENTICATE` when no password is set
    #[serde(default)]
    pub cookie_path: Option<PathBuf>,

    /// Domain suffix (e.g. `pet.onion`) → plugin command
    #[serde(default)]
    pub services: HashMap<String, ServiceCommand>,

    /// Passed to plugins as `TOR_NS_STATE_LOCATION`
    #[serde(default = "default_state_location")]
    pub state_location: PathBuf,

    #[serde(default = "default_query_window_secs")]
    pub query_window_secs: u64,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Delay between attempts to reach the control port at startup
    #[serde(default = "default_connect_retry_ms")]
    pub connect_retry_ms: u64,

    #[serde(default)]
    pub on_bootstrap: Vec<HookCommand>,

    #[serde(default)]
    pub on_controller_lost: Vec<HookCommand>,
}

fn default_control_address() -> String {
    "127.0.0.1:9051".to_string()
}

fn default_state_location() -> PathBuf {
    PathBuf::from("/var/lib/tor/ns_state")
}

fn default_query_window_secs() -> u64 {
    60
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_connect_retry_ms() -> u64 {
    50
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            control_address: default_control_address(),
            control_password: None,
            cookie_path: None,
            services: HashMap::new(),
            state_location: default_state_location(),
            query_window_secs: default_query_window_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            connect_retry_ms: default_connect_retry_ms(),
            on_bootstrap: Vec::new(),
            on_controller_lost: Vec::new(),
        }
    }
}

/// One file of a configuration directory; every field optional
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFragment {
    control_address: Option<String>,
    control_password: Option<String>,
    cookie_path: Option<PathBuf>,
    services: Option<HashMap<String, ServiceCommand>>,
    state_location: Option<PathBuf>,
    query_window_secs: Option<u64>,
    retry_delay_ms: Option<u64>,
    connect_retry_ms: Option<u64>,
    #[serde(default)]
    on_bootstrap: Vec<HookCommand>,
    #[serde(default)]
    on_controller_lost: Vec<HookCommand>,
}

impl BrokerConfig {
    /// Load from a file, or merge every `*.json` file of a directory
    pub fn load(path: &Path) -> Result<Self> {
        if path.is_dir() {
            Self::from_dir(path)
        } else {
            Self::from_file(path)
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let src = std::fs::read_to_string(path)
            .map_err(|e| BrokerError::Config(format!("cannot read {}: {e}", path.display())))?;
        let cfg: BrokerConfig = serde_json::from_str(&src)
            .map_err(|e| BrokerError::Config(format!("parse error in {}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Merge fragments in sorted filename order
    ///
    /// Scalars shadow (last file wins), services merge, hook lists
    /// concatenate.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| BrokerError::Config(format!("cannot read {}: {e}", dir.display())))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut fragments = Vec::with_capacity(files.len());
        for file in &files {
            let src = std::fs::read_to_string(file)
                .map_err(|e| BrokerError::Config(format!("cannot read {}: {e}", file.display())))?;
            let fragment: ConfigFragment = serde_json::from_str(&src).map_err(|e| {
                BrokerError::Config(format!("parse error in {}: {e}", file.display()))
            })?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            fragments.push((name, fragment));
        }

        let cfg = Self::merge(fragments);
        cfg.validate()?;
        Ok(cfg)
    }

    fn merge(fragments: Vec<(String, ConfigFragment)>) -> Self {
        let mut cfg = Self::default();
        // option name → files that set it
        let mut setters: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
        // suffix → files that define it
        let mut service_sources: BTreeMap<String, Vec<String>> = BTreeMap::new();

        macro_rules! shadow {
            ($frag:expr, $file:expr, $field:ident, $name:literal, $wrap:expr) => {
                if let Some(value) = $frag.$field.take() {
                    cfg.$field = $wrap(value);
                    setters.entry($name).or_default().push($file.clone());
                }
            };
        }

        for (file, mut frag) in fragments {
            shadow!(frag, file, control_address, "controlAddress", |v| v);
            shadow!(frag, file, control_password, "controlPassword", Some);
            shadow!(frag, file, cookie_path, "cookiePath", Some);
            shadow!(frag, file, state_location, "stateLocation", |v| v);
            shadow!(frag, file, query_window_secs, "queryWindowSecs", |v| v);
            shadow!(frag, file, retry_delay_ms, "retryDelayMs", |v| v);
            shadow!(frag, file, connect_retry_ms, "connectRetryMs", |v| v);

            if let Some(services) = frag.services.take() {
                for (suffix, service) in services {
                    service_sources.entry(suffix.clone()).or_default().push(file.clone());
                    cfg.services.insert(suffix, service);
                }
            }

            cfg.on_bootstrap.append(&mut frag.on_bootstrap);
            cfg.on_controller_lost.append(&mut frag.on_controller_lost);
        }

        for (option, files) in setters.iter().filter(|(_, files)| files.len() > 1) {
            tracing::warn!(
                option = %option,
                files = %files.join(", "),
                "Config option set multiple times; the last file wins"
            );
        }
        for (suffix, files) in service_sources.iter().filter(|(_, files)| files.len() > 1) {
            tracing::warn!(
                suffix = %suffix,
                files = %files.join(", "),
                "Service defined multiple times; the last file wins"
            );
        }

        cfg
    }

    pub fn validate(&self) -> Result<()> {
        for (suffix, service) in &self.services {
            if suffix.is_empty() || suffix.starts_with('.') || suffix.ends_with('.') {
                return Err(BrokerError::Config(format!(
                    "invalid service suffix '{suffix}'"
                )));
            }
            if service.command.trim().is_empty() {
                return Err(BrokerError::Config(format!(
                    "service '{suffix}' has an empty command"
                )));
            }
        }
        if self.query_window_secs == 0 {
            return Err(BrokerError::Config("queryWindowSecs must be positive".to_string()));
        }

        for a in self.services.keys() {
            for b in self.services.keys() {
                if a != b && a.ends_with(&format!(".{b}")) {
                    tracing::warn!(
                        longer = %a,
                        shorter = %b,
                        "Overlapping service suffixes; the longest match wins"
                    );
                }
            }
        }
        if self.services.is_empty() {
            tracing::warn!("No name services configured; every stream will pass through");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            window: Duration::from_secs(self.query_window_secs),
            backoff: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    /// Launch environment for the plugin serving `suffix`
    pub fn plugin_env(&self, suffix: &str) -> PluginEnv {
        let options = self
            .services
            .get(suffix)
            .map(|s| s.options.clone())
            .unwrap_or_default();
        PluginEnv::new(self.state_location.clone(), options)
    }

    pub fn with_service(mut self, suffix: impl Into<String>, service: ServiceCommand) -> Self {
        self.services.insert(suffix.into(), service);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("torns-config-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_defaults() {
        let cfg: BrokerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.control_address, "127.0.0.1:9051");
        assert_eq!(cfg.state_location, PathBuf::from("/var/lib/tor/ns_state"));
        assert_eq!(cfg.retry_policy(), RetryPolicy::default());
        assert!(cfg.services.is_empty());
    }

    #[test]
    fn test_from_file() {
        let dir = temp_dir();
        let path = dir.join("torns.json");
        std::fs::write(
            &path,
            r#"{
                "controlAddress": "127.0.0.1:9151",
                "services": {
                    "pet.onion": { "command": "torns-petname", "options": "names=/etc/pets.json" }
                },
                "queryWindowSecs": 30
            }"#,
        )
        .unwrap();

        let cfg = BrokerConfig::load(&path).unwrap();
        assert_eq!(cfg.control_address, "127.0.0.1:9151");
        assert_eq!(cfg.services["pet.onion"].command, "torns-petname");
        assert_eq!(cfg.plugin_env("pet.onion").options(), "names=/etc/pets.json");
        assert_eq!(cfg.retry_policy().window, Duration::from_secs(30));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_from_dir_merges_in_filename_order() {
        let dir = temp_dir();
        std::fs::write(
            dir.join("10-base.json"),
            r#"{
                "controlAddress": "127.0.0.1:9051",
                "services": { "pet.onion": { "command": "a" }, "demo.onion": { "command": "d" } },
                "onBootstrap": [ { "command": "first" } ]
            }"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("20-local.json"),
            r#"{
                "controlAddress": "127.0.0.1:9151",
                "services": { "pet.onion": { "command": "b" } },
                "onBootstrap": [ { "command": "second" } ]
            }"#,
        )
        .unwrap();
        std::fs::write(dir.join("README.txt"), "not config").unwrap();

        let cfg = BrokerConfig::load(&dir).unwrap();
        assert_eq!(cfg.control_address, "127.0.0.1:9151");
        assert_eq!(cfg.services["pet.onion"].command, "b");
        assert_eq!(cfg.services["demo.onion"].command, "d");
        let hooks: Vec<&str> = cfg.on_bootstrap.iter().map(|h| h.command.as_str()).collect();
        assert_eq!(hooks, vec!["first", "second"]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_suffix() {
        let cfg = BrokerConfig::default().with_service(".onion", ServiceCommand::new("x", vec![]));
        assert!(matches!(cfg.validate(), Err(BrokerError::Config(_))));

        let cfg = BrokerConfig::default().with_service("pet.onion", ServiceCommand::new("  ", vec![]));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let cfg = BrokerConfig {
            query_window_secs: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = temp_dir();
        let path = dir.join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = BrokerConfig::load(&path).unwrap_err().to_string();
        assert!(err.contains("broken.json"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
