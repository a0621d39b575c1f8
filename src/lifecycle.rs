//! Bootstrap and controller-liveness hooks

use crate::config::{BrokerConfig, HookCommand};
use crate::types::BootstrapStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Callback run when a lifecycle point is reached
pub type Hook = Box<dyn Fn() + Send + Sync>;

/// Callbacks for first full bootstrap and for loss of the controller
#[derive(Default)]
pub struct LifecycleHooks {
    bootstrap: Vec<Hook>,
    controller_lost: Vec<Hook>,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hooks that run the configured `onBootstrap` / `onControllerLost` commands
    pub fn from_config(config: &BrokerConfig) -> Self {
        let mut hooks = Self::new();
        for command in &config.on_bootstrap {
            hooks = hooks.on_bootstrap(command_hook("bootstrap", command.clone()));
        }
        for command in &config.on_controller_lost {
            hooks = hooks.on_controller_lost(command_hook("controller-lost", command.clone()));
        }
        hooks
    }

    pub fn on_bootstrap(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.bootstrap.push(Box::new(hook));
        self
    }

    pub fn on_controller_lost(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.controller_lost.push(Box::new(hook));
        self
    }

    pub fn run_bootstrap(&self) {
        tracing::info!(hooks = self.bootstrap.len(), "Bootstrap complete");
        self.bootstrap.iter().for_each(|hook| hook());
    }

    pub fn run_controller_lost(&self) {
        tracing::warn!(hooks = self.controller_lost.len(), "Controller connection lost");
        self.controller_lost.iter().for_each(|hook| hook());
    }
}

/// Spawn the command without waiting for it; failures are logged
fn command_hook(event: &'static str, hook: HookCommand) -> impl Fn() + Send + Sync + 'static {
    move || {
        let mut cmd = tokio::process::Command::new(&hook.command);
        cmd.args(&hook.args);
        match cmd.spawn() {
            Ok(mut child) => {
                let command = hook.command.clone();
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) if status.success() => {
                            tracing::debug!(event, command = %command, "Hook finished");
                        }
                        Ok(status) => {
                            tracing::warn!(event, command = %command, status = %status, "Hook failed");
                        }
                        Err(e) => {
                            tracing::warn!(event, command = %command, error = %e, "Hook failed");
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!(event, command = %hook.command, error = %e, "Failed to start hook");
            }
        }
    }
}

/// Fires the bootstrap hooks on the first report of 100% progress
pub struct BootstrapMonitor {
    hooks: Arc<LifecycleHooks>,
    fired: AtomicBool,
}

impl BootstrapMonitor {
    pub fn new(hooks: Arc<LifecycleHooks>) -> Self {
        Self {
            hooks,
            fired: AtomicBool::new(false),
        }
    }

    /// Feed a progress report; returns true only for the report that fired the hooks
    pub fn observe(&self, status: &BootstrapStatus) -> bool {
        tracing::debug!(progress = status.progress, tag = ?status.tag, "Bootstrap progress");
        if !status.is_complete() {
            return false;
        }
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.hooks.run_bootstrap();
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn status(progress: u8) -> BootstrapStatus {
        BootstrapStatus {
            progress,
            tag: None,
            summary: None,
        }
    }

    #[test]
    fn test_bootstrap_hooks_fire_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let hooks = LifecycleHooks::new().on_bootstrap(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let monitor = BootstrapMonitor::new(Arc::new(hooks));

        assert!(!monitor.observe(&status(50)));
        assert!(!monitor.has_fired());
        assert!(monitor.observe(&status(100)));
        assert!(!monitor.observe(&status(100)));
        assert!(monitor.has_fired());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_controller_lost_runs_all_hooks() {
        let count = Arc::new(AtomicUsize::new(0));
        let (a, b) = (count.clone(), count.clone());
        let hooks = LifecycleHooks::new()
            .on_controller_lost(move || {
                a.fetch_add(1, Ordering::SeqCst);
            })
            .on_controller_lost(move || {
                b.fetch_add(10, Ordering::SeqCst);
            });
        hooks.run_controller_lost();
        hooks.run_bootstrap();
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_command_hooks_run() {
        let marker = std::env::temp_dir().join(format!("torns-hook-{}", uuid::Uuid::new_v4()));
        let config = BrokerConfig {
            on_bootstrap: vec![HookCommand {
                command: "touch".to_string(),
                args: vec![marker.to_string_lossy().into_owned()],
            }],
            on_controller_lost: vec![HookCommand {
                command: "/nonexistent/torns-hook".to_string(),
                args: vec![],
            }],
            ..BrokerConfig::default()
        };
        let hooks = LifecycleHooks::from_config(&config);
        hooks.run_bootstrap();
        hooks.run_controller_lost();

        for _ in 0..200 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(marker.exists());
        let _ = std::fs::remove_file(&marker);
    }
}
