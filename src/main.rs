// ABOUTME: Command-line entry point: run the relay broker, one agent, or a whole swarm.
// ABOUTME: Initializes logging (stdout plus optional rolling file), loads config and waits for ctrl-c.

use anyhow::{Context, Result};
use chorus::{client::HttpRelayClient, runtime::AgentRuntime, server};
use chorus_core::{config::Config, paths, LocalRelay, RelayBroker, RelayTransport};
use chorus_producer::{ContentProducer, ProducerRegistry};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Debug, Parser)]
#[command(name = "chorus")]
#[command(about = "Relay broker and conversation orchestrator for multi-agent group chat")]
struct Cli {
    /// Config file (defaults to CHORUS_CONFIG_PATH, ./config.toml, then ~/.config/chorus/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Also write daily-rotated logs under the data directory
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the relay broker HTTP server
    Broker {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one configured agent against the broker
    Agent {
        #[arg(long)]
        id: String,
    },
    /// Run every configured agent
    Swarm {
        /// Use an in-process broker instead of the HTTP one
        #[arg(long)]
        local: bool,
    },
    /// Validate the configuration and print a summary
    CheckConfig,
}

fn init_logging(json: bool, log_file: bool) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
    };

    let stdout_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let (file_layer, guard) = if log_file {
        let dir = paths::log_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(&dir, "chorus.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_filter(filter());
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(stdout_layer.with_filter(filter()))
        .with(file_layer)
        .init();
    Ok(guard)
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::from_path(path),
        None => Config::load(),
    }
}

fn build_producer(config: &Config) -> Result<Arc<dyn ContentProducer>> {
    let registry = ProducerRegistry::default();
    let options = config.producer.options_json()?;
    registry
        .create(&config.producer.producer_type, &options)
        .with_context(|| {
            format!(
                "Failed to create producer '{}' (available: {})",
                config.producer.producer_type,
                registry.available().join(", ")
            )
        })
}

/// Cancel `token` on ctrl-c
fn spawn_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for ctrl-c"),
        }
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    let _log_guard = init_logging(cli.log_json, cli.log_file)?;

    let mut config = load_config(cli.config.as_ref())?;
    let shutdown = CancellationToken::new();

    match cli.command {
        Commands::Broker { host, port } => {
            if let Some(host) = host {
                config.broker.host = host;
            }
            if let Some(port) = port {
                config.broker.port = port;
            }
            spawn_ctrl_c(shutdown.clone());
            server::run_broker(Arc::new(config), shutdown).await
        }
        Commands::Agent { id } => {
            let agent = config.agent_config(&id)?.clone();
            let producer = build_producer(&config)?;
            let transport: Arc<dyn RelayTransport> =
                Arc::new(HttpRelayClient::new(&config.broker.url)?);
            tracing::info!(agent_id = %id, broker = %config.broker.url, "Starting agent");
            let runtime = AgentRuntime::new(agent, &config, transport, producer)?;
            spawn_ctrl_c(shutdown.clone());
            runtime.run(shutdown).await
        }
        Commands::Swarm { local } => {
            if config.agents.is_empty() {
                anyhow::bail!("No agents configured");
            }
            let producer = build_producer(&config)?;
            let transport: Arc<dyn RelayTransport> = if local {
                let broker = Arc::new(RelayBroker::from_config(&config.broker));
                server::spawn_sweeper(
                    Arc::clone(&broker),
                    config.broker.sweep_interval(),
                    shutdown.child_token(),
                );
                Arc::new(LocalRelay::new(broker))
            } else {
                Arc::new(HttpRelayClient::new(&config.broker.url)?)
            };
            tracing::info!(
                agents = config.agents.len(),
                transport = transport.name(),
                "Starting swarm"
            );

            let mut tasks = JoinSet::new();
            for agent in config.agents.clone() {
                let runtime =
                    AgentRuntime::new(agent, &config, Arc::clone(&transport), Arc::clone(&producer))?;
                tasks.spawn(runtime.run(shutdown.child_token()));
            }
            spawn_ctrl_c(shutdown.clone());

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!(error = %format!("{:#}", e), "Agent stopped with error"),
                    Err(e) => tracing::error!(error = %e, "Agent task panicked"),
                }
            }
            Ok(())
        }
        Commands::CheckConfig => {
            let producer = build_producer(&config)?;
            println!(
                "broker: {} (agents connect to {})",
                config.broker.bind_addr(),
                config.broker.url
            );
            println!(
                "conversations: {}-{} messages, idle timeout {}s, timezone {}",
                config.orchestrator.min_messages,
                config.orchestrator.max_messages,
                config.orchestrator.idle_timeout_secs,
                config.orchestrator.timezone
            );
            println!("producer: {}", producer.name());
            for agent in &config.agents {
                println!(
                    "agent {}: topics [{}], interests [{}]",
                    agent.id,
                    agent.opening_topics().join(", "),
                    agent.interests().join(", ")
                );
            }
            Ok(())
        }
    }
}
