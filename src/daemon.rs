//! git2kv daemon
//!
//! Wires configuration, adapters, the registry and trigger sources together
//! and runs until SIGTERM/SIGINT or a shutdown command.
//!
//! ## Startup Phases
//!
//! 1. **Validate Phase**: Process-wide settings; any error is fatal
//! 2. **Registry Phase**: Clone or pull every branch and run its first sync
//! 3. **Trigger Phase**: Register webhooks per port/path, start polling timers
//!    and the optional metrics endpoint
//!
//! After startup every change arrives through a trigger source; the daemon
//! loop itself only waits for signals and commands.

use crate::config::{validate_settings, Git2KvConfig, RepoConfig};
use crate::git::{GitAdapter, GitCredentials, VersionControl};
use crate::hooks::{start_polling, HookError, HookSpec, WebhookRegistry};
use crate::kv::KvStore;
use crate::metrics;
use crate::registry::{Registry, RepoHandle, RepoStartError};
use crate::{Git2KvError, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Builds the version-control adapter of a repository
pub type VcsFactory = Arc<dyn Fn(&RepoConfig) -> Arc<dyn VersionControl> + Send + Sync>;

/// Commands that can be sent to a running daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonCommand {
    /// Request a sync of every branch now
    SyncAll,
    /// Stop the daemon
    Shutdown,
}

/// A polling timer to start
#[derive(Clone)]
pub struct PollPlan {
    pub repo: Arc<RepoHandle>,
    pub interval: Duration,
    pub immediate: bool,
}

/// Trigger sources derived from the configuration of the started repos
#[derive(Default)]
pub struct TriggerPlan {
    pub webhooks: WebhookRegistry,
    pub polls: Vec<PollPlan>,
    /// Repositories left out because one of their hooks could not be registered
    pub failures: Vec<RepoStartError>,
}

impl TriggerPlan {
    /// Register the hooks of every started repository.
    ///
    /// A repository is registered all or nothing: when any of its hooks is
    /// malformed or claims a port and path already taken, none of its hooks
    /// run and it is reported in `failures`.
    pub fn build(config: &Git2KvConfig, registry: &Registry) -> Self {
        let mut plan = TriggerPlan::default();

        for repo_config in &config.repos {
            let Some(repo) = registry.repo(&repo_config.name) else {
                continue;
            };

            let mut specs = Vec::new();
            let mut errors = Vec::new();
            for hook in &repo_config.hooks {
                match HookSpec::parse(hook) {
                    Ok(spec) => specs.push(spec),
                    Err(e) => errors.push(e),
                }
            }

            let mut claimed = HashSet::new();
            for spec in &specs {
                if let HookSpec::Webhook { port, path, .. } = spec {
                    if plan.webhooks.contains(*port, path) || !claimed.insert((*port, path.clone())) {
                        errors.push(HookError::Conflict {
                            port: *port,
                            path: path.clone(),
                        });
                    }
                }
            }

            if !errors.is_empty() {
                for e in &errors {
                    tracing::error!(repo = %repo_config.name, error = %e, "Hook configuration failed");
                }
                plan.failures.push(RepoStartError {
                    repo: repo_config.name.clone(),
                    errors: errors
                        .iter()
                        .map(|e| format!("Hook configuration failed due to {}", e))
                        .collect(),
                });
                continue;
            }

            for spec in specs {
                match spec {
                    HookSpec::Webhook {
                        provider,
                        port,
                        path,
                    } => {
                        // Unclaimed, checked above
                        if let Err(e) = plan.webhooks.register(port, path, provider, Arc::clone(&repo)) {
                            tracing::error!(repo = %repo_config.name, error = %e, "Hook configuration failed");
                        }
                    }
                    HookSpec::Polling {
                        interval,
                        immediate,
                    } => plan.polls.push(PollPlan {
                        repo: Arc::clone(&repo),
                        interval,
                        immediate,
                    }),
                }
            }
        }

        plan
    }

    pub fn is_empty(&self) -> bool {
        self.webhooks.is_empty() && self.polls.is_empty()
    }
}

/// The git2kv daemon
pub struct Daemon {
    config: Git2KvConfig,
    kv: Arc<dyn KvStore>,
    vcs_factory: VcsFactory,
    registry: Registry,
    tasks: Vec<JoinHandle<()>>,
    command_tx: mpsc::Sender<DaemonCommand>,
    command_rx: Option<mpsc::Receiver<DaemonCommand>>,
}

impl Daemon {
    /// Create a daemon using libgit2 for every repository
    pub fn new(config: Git2KvConfig, kv: Arc<dyn KvStore>) -> Self {
        let factory: VcsFactory = Arc::new(|repo: &RepoConfig| {
            Arc::new(GitAdapter::new(GitCredentials::from_repo_config(repo)))
                as Arc<dyn VersionControl>
        });
        Self::with_vcs_factory(config, kv, factory)
    }

    pub fn with_vcs_factory(
        config: Git2KvConfig,
        kv: Arc<dyn KvStore>,
        vcs_factory: VcsFactory,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        Self {
            config,
            kv,
            vcs_factory,
            registry: Registry::default(),
            tasks: Vec::new(),
            command_tx,
            command_rx: Some(command_rx),
        }
    }

    /// Sender for controlling a running daemon
    pub fn command_sender(&self) -> mpsc::Sender<DaemonCommand> {
        self.command_tx.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Validate settings and start every repository.
    ///
    /// Fails when the settings are invalid or when no repository started.
    /// Returns the repositories that did not start.
    pub async fn start(&mut self) -> Result<Vec<RepoStartError>> {
        if let Err(errors) = validate_settings(&self.config) {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            return Err(Git2KvError::Config(messages.join("; ")));
        }

        tracing::info!(
            repos = self.config.repos.len(),
            local_store = %self.config.local_store.display(),
            "git2kv is starting"
        );

        let factory = Arc::clone(&self.vcs_factory);
        let (registry, failures) =
            Registry::start(&self.config, Arc::clone(&self.kv), |repo| factory(repo)).await;

        for failure in &failures {
            tracing::error!(repo = %failure.repo, "{}", failure);
        }

        if registry.is_empty() {
            return Err(Git2KvError::Config(format!(
                "No repo could be started ({} failed)",
                failures.len()
            )));
        }

        tracing::info!(
            repos = registry.len(),
            branches = registry.units().count(),
            failed = failures.len(),
            "Repos started"
        );

        self.registry = registry;
        Ok(failures)
    }

    /// Start webhook listeners, polling timers and the metrics endpoint.
    ///
    /// Repositories whose hooks cannot be registered are stopped and
    /// returned; fails when none is left.
    pub async fn start_triggers(&mut self) -> Result<Vec<RepoStartError>> {
        let plan = TriggerPlan::build(&self.config, &self.registry);

        for failure in &plan.failures {
            tracing::error!(repo = %failure.repo, "{}", failure);
            self.registry.remove(&failure.repo);
        }
        if self.registry.is_empty() {
            return Err(Git2KvError::Config(format!(
                "No repo could be started ({} failed)",
                plan.failures.len()
            )));
        }

        if plan.is_empty() {
            tracing::warn!("No trigger sources configured, branches were synced once at startup");
        }

        for poll in plan.polls {
            self.tasks
                .push(start_polling(poll.repo, poll.interval, poll.immediate));
        }

        let servers = plan
            .webhooks
            .serve()
            .await
            .map_err(|e| Git2KvError::Hook(e.to_string()))?;
        self.tasks.extend(servers);

        if let Some(port) = self.config.metrics_port {
            self.tasks.push(tokio::spawn(async move {
                if let Err(e) = metrics::serve(port).await {
                    tracing::error!(port, error = %e, "Metrics endpoint stopped");
                }
            }));
        }

        Ok(plan.failures)
    }

    /// Start everything and run until a signal or shutdown command
    pub async fn run(&mut self) -> Result<()> {
        let mut command_rx = self
            .command_rx
            .take()
            .ok_or_else(|| Git2KvError::Other("Daemon already running".to_string()))?;

        self.start().await?;
        self.start_triggers().await?;
        metrics::set_health_status(true);
        tracing::info!("git2kv is running");

        #[cfg(unix)]
        self.run_with_signals(&mut command_rx).await?;

        #[cfg(not(unix))]
        self.run_without_signals(&mut command_rx).await?;

        tracing::info!("Performing shutdown cleanup");
        self.cleanup();
        metrics::set_health_status(false);
        Ok(())
    }

    /// Event loop with Unix signal handling (SIGTERM/SIGINT)
    #[cfg(unix)]
    async fn run_with_signals(
        &mut self,
        command_rx: &mut mpsc::Receiver<DaemonCommand>,
    ) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            Git2KvError::Other(format!("Failed to set up SIGTERM handler: {}", e))
        })?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
            Git2KvError::Other(format!("Failed to set up SIGINT handler: {}", e))
        })?;

        loop {
            tokio::select! {
                Some(cmd) = command_rx.recv() => {
                    if self.handle_command(cmd) {
                        break;
                    }
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    break;
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Event loop without signal handling (non-Unix platforms)
    #[cfg(not(unix))]
    async fn run_without_signals(
        &mut self,
        command_rx: &mut mpsc::Receiver<DaemonCommand>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                Some(cmd) = command_rx.recv() => {
                    if self.handle_command(cmd) {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl-C, initiating graceful shutdown");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Handle a command; returns true when the daemon should stop
    fn handle_command(&mut self, cmd: DaemonCommand) -> bool {
        match cmd {
            DaemonCommand::SyncAll => {
                tracing::info!("Sync of every branch requested");
                for repo in self.registry.repos() {
                    repo.dispatch_all("command");
                }
                false
            }
            DaemonCommand::Shutdown => {
                tracing::info!("Received shutdown command");
                true
            }
        }
    }

    /// Stop trigger tasks and log the final state of every branch
    pub fn cleanup(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }

        for unit in self.registry.units() {
            let status = unit.status();
            tracing::info!(
                branch = %unit.descriptor(),
                cycles = status.cycles,
                failures = status.failures,
                coalesced = status.coalesced,
                last_ref = status.last_ref.as_deref().unwrap_or("<none>"),
                last_error = status.last_error.as_deref().unwrap_or(""),
                "Branch status"
            );
        }

        tracing::info!(repos = self.registry.len(), "git2kv daemon shutdown complete");
    }
}
