//! git2kv - Mirror git branches into a Consul-style key-value store
//!
//! Main entry point for the git2kv CLI.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use git2kv::config::{validate_config, Git2KvConfig, KvConfig, DEFAULT_CONFIG_KEY};
use git2kv::daemon::Daemon;
use git2kv::kv::{ConsulKv, KvStore, MemoryKv};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// git2kv - Mirror git branches into a key-value store
#[derive(Parser, Debug)]
#[command(name = "git2kv")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "GIT2KV_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where the configuration is read from
#[derive(Args, Debug)]
struct ConfigSource {
    /// Path to config file (default: ~/.config/git2kv/config.yaml)
    #[arg(short, long, env = "GIT2KV_CONFIG", conflicts_with = "config_key")]
    config: Option<PathBuf>,

    /// Read the configuration (YAML or JSON) from a KV key instead of a file
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_CONFIG_KEY)]
    config_key: Option<String>,

    /// KV endpoint holding the configuration, with --config-key
    #[arg(long, env = "GIT2KV_KV_ENDPOINT", default_value = "http://127.0.0.1:8500")]
    kv_endpoint: String,

    /// KV ACL token, literal or $ENV_VAR, with --config-key
    #[arg(long, env = "GIT2KV_KV_TOKEN")]
    kv_token: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sync every configured branch and keep it in sync
    Run {
        #[command(flatten)]
        source: ConfigSource,

        /// Sync every branch once, then exit
        #[arg(long)]
        once: bool,

        /// Sync into an in-memory store and print the resulting keys (implies --once)
        #[arg(long)]
        dry_run: bool,
    },

    /// Check a configuration and exit
    Validate {
        #[command(flatten)]
        source: ConfigSource,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    if let Err(e) = git2kv::logging::init(cli.log_json) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Validate { source } => handle_validate(source).await,
        Commands::Run {
            source,
            once,
            dry_run,
        } => handle_run(source, once, dry_run).await,
    }
}

async fn load_config(source: ConfigSource) -> anyhow::Result<Git2KvConfig> {
    let Some(key) = source.config_key else {
        let path = source.config.unwrap_or_else(Git2KvConfig::default_path);
        return Git2KvConfig::load(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()));
    };

    let store = KvConfig {
        endpoint: source.kv_endpoint,
        token: source.kv_token,
        ..Default::default()
    };
    let kv = ConsulKv::from_config(&store).context("Failed to configure KV client")?;
    let mut config = Git2KvConfig::load_from_kv(&kv, &key)
        .await
        .with_context(|| format!("Failed to load configuration from KV key {}", key))?;

    // Branches are mirrored into the store holding the configuration
    config.kv.endpoint = store.endpoint;
    config.kv.token = store.token;
    Ok(config)
}

async fn handle_validate(source: ConfigSource) -> anyhow::Result<()> {
    let config = load_config(source).await?;

    match validate_config(&config) {
        Ok(()) => {
            let branches: usize = config.repos.iter().map(|r| r.branches.len()).sum();
            println!(
                "Configuration is valid: {} repos, {} branches",
                config.repos.len(),
                branches
            );
            Ok(())
        }
        Err(errors) => {
            for error in &errors {
                println!("  - {}", error);
            }
            anyhow::bail!("Configuration has {} errors", errors.len())
        }
    }
}

async fn handle_run(source: ConfigSource, once: bool, dry_run: bool) -> anyhow::Result<()> {
    let config = load_config(source).await?;

    let memory = MemoryKv::new();
    let kv: Arc<dyn KvStore> = if dry_run {
        tracing::info!("Dry run, writing to an in-memory store");
        Arc::new(memory.clone())
    } else {
        Arc::new(ConsulKv::from_config(&config.kv).context("Failed to configure KV client")?)
    };

    let mut daemon = Daemon::new(config, kv);

    if !(once || dry_run) {
        return daemon.run().await.context("Daemon failed");
    }

    let failures = daemon.start().await.context("Startup sync failed")?;
    daemon.cleanup();

    if dry_run {
        for (key, value) in memory.snapshot() {
            println!("{} = {}", key, String::from_utf8_lossy(&value));
        }
    }

    if !failures.is_empty() {
        anyhow::bail!("{} repos failed to sync", failures.len());
    }
    Ok(())
}
