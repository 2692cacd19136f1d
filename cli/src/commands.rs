use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use datapath::{IpCacheStore, IpSetStore, RouteTable};
use node_manager::checkpoint::Checkpointer;
use node_manager::{CheckpointError, HealthReporter, Identity, Manager};

use crate::config::AgentConfig;
use crate::logging::{self, LogFormat};
use crate::server::{self, AppState};
use crate::source::{SourceError, StaticSource};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("failed to read config {path}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to initialize logging")]
    Logging(#[from] tracing_subscriber::util::TryInitError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("failed to encode output")]
    Encode(#[from] serde_json::Error),
    #[error("status API failed")]
    Server(#[source] std::io::Error),
}

#[derive(Debug, Parser)]
#[command(name = "fleetnode", version)]
#[command(about = "Track fleet nodes and keep the datapath in sync")]
pub struct Cli {
    /// Output format of stdout logs
    #[arg(long, value_enum, default_value_t = LogFormat::Plain, global = true)]
    log_format: LogFormat,

    /// Also write JSON logs to a daily rotated file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    pub async fn handle() -> Result<(), CliError> {
        let cli = Cli::parse();
        let _guard = logging::init(cli.log_format, cli.log_dir.as_deref())?;

        match cli.command {
            Commands::Run(cmd) => cmd.execute().await,
            Commands::Checkpoint { command } => match command {
                CheckpointCommand::Show(cmd) => cmd.execute(),
            },
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the node agent
    Run(Run),
    /// Inspect the on-disk node checkpoint
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommand,
    },
}

#[derive(Debug, Subcommand)]
enum CheckpointCommand {
    /// Print the nodes stored in the checkpoint
    Show(Show),
}

#[derive(Debug, Parser)]
struct Run {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    cluster_name: Option<String>,

    #[arg(long)]
    node_name: Option<String>,

    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Status API address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// JSON file listing the fleet's nodes
    #[arg(long)]
    nodes: Option<PathBuf>,
}

impl Run {
    async fn load_config(&self) -> Result<AgentConfig, CliError> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::load(path).await?,
            None => AgentConfig::default(),
        };
        if let Some(cluster) = &self.cluster_name {
            config.manager.cluster_name = cluster.clone();
        }
        if let Some(node) = &self.node_name {
            config.manager.node_name = node.clone();
        }
        if let Some(dir) = &self.state_dir {
            config.manager.state_dir = dir.clone();
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(nodes) = &self.nodes {
            config.nodes_file = Some(nodes.clone());
        }
        Ok(config)
    }

    async fn execute(&self) -> Result<(), CliError> {
        let config = self.load_config().await?;
        info!(
            cluster = %config.manager.cluster_name,
            node = %config.manager.node_name,
            state_dir = %config.manager.state_dir.display(),
            "Starting fleet node agent"
        );

        let local = Identity::new(
            config.manager.cluster_name.clone(),
            config.manager.node_name.clone(),
        );
        let health = Arc::new(HealthReporter::new());
        let ipcache = Arc::new(IpCacheStore::new());
        let ipset = Arc::new(IpSetStore::new());
        let routes = Arc::new(RouteTable::new(local));

        let manager = Arc::new(Manager::new(
            config.manager.clone(),
            ipcache.clone(),
            ipset.clone(),
            None,
            health.clone(),
        ));
        manager.subscribe(routes.clone());
        manager.start()?;

        let cancel = CancellationToken::new();

        if let Some(path) = &config.nodes_file {
            let source = StaticSource::new(path);
            tokio::spawn(source.run(
                manager.clone(),
                Duration::from_secs(config.nodes_poll_secs.max(1)),
                cancel.clone(),
            ));
        }

        let state = AppState {
            manager: manager.clone(),
            health,
            ipcache,
            ipset,
            routes,
        };
        let server = tokio::spawn(server::serve(config.listen, state, cancel.clone()));

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received interrupt, shutting down"),
            _ = manager.stopped() => info!("Node manager stopped itself, shutting down"),
        }

        cancel.cancel();
        stop_manager(manager).await;

        match server.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(CliError::Server(err)),
            Err(err) => {
                error!(?err, "Status API task panicked");
                Ok(())
            }
        }
    }
}

/// Stops the manager off the async workers: the final checkpoint is a
/// blocking file write.
async fn stop_manager(manager: Arc<Manager>) {
    if let Err(err) = tokio::task::spawn_blocking(move || manager.stop()).await {
        error!(?err, "Node manager shutdown panicked");
    }
}

#[derive(Debug, Parser)]
struct Show {
    /// State directory holding the checkpoint
    #[arg(long, default_value = "/run/fleetnode/state")]
    state_dir: PathBuf,

    /// Print the raw node records as JSON
    #[arg(long)]
    json: bool,
}

impl Show {
    fn execute(&self) -> Result<(), CliError> {
        let nodes = Checkpointer::new(&self.state_dir).restore()?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&nodes)?);
            return Ok(());
        }
        for node in &nodes {
            let addrs: Vec<String> = node.ip_addresses.iter().map(|a| a.ip.to_string()).collect();
            let cidrs: Vec<String> = node
                .ipv4_alloc_cidrs()
                .iter()
                .chain(node.ipv6_alloc_cidrs().iter())
                .map(|c| c.to_string())
                .collect();
            println!("{}\t{}\t{}", node.identity(), addrs.join(","), cidrs.join(","));
        }
        println!("{} node(s)", nodes.len());
        Ok(())
    }
}
