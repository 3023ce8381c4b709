use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cloudmesh::cli::{
    format_dry_run, format_node_table, parse_peer_arg, Cli, Commands, InitArgs, ServeArgs,
};
use cloudmesh::cluster::{
    spawn_snapshot_publisher, system_memory_mb, ClusterRuntime, PEER_RETRY_SECS,
};
use cloudmesh::config::{
    default_config_path, load_node_config, load_node_config_or_default, save_node_config,
    validate_node_config, NodeConfig,
};
use cloudmesh::messaging::{event_channel, TcpTransport};
use cloudmesh::service::DefaultServiceManager;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let result = match &cli.command {
        Commands::Serve(args) => serve(cli.config.clone(), args).await,
        Commands::Init(args) => init(cli.config.clone(), args),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn serve(config_path: Option<PathBuf>, args: &ServeArgs) -> Result<()> {
    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("Failed to load env file {}", env_file.display()))?;
    }

    let (path, mut config) = load_config(config_path)?;
    if let Some(ref id) = args.node_id {
        config.node.id = id.clone();
    }
    if let Some(ref listen) = args.listen {
        config.node.listen = listen.clone();
    }
    validate_node_config(&config).context("Invalid node config")?;

    let memory_mb = config.max_service_memory_mb.unwrap_or_else(system_memory_mb);

    // Dry-run mode: print cluster layout and exit
    if args.dry_run {
        println!("{}", format_dry_run(&config, &path, memory_mb));
        return Ok(());
    }

    let identity = config.identity();
    let services = Arc::new(DefaultServiceManager::new(identity.id.clone(), memory_mb));

    let (events_tx, events_rx) = event_channel();
    let transport = TcpTransport::new(identity.clone(), events_tx);
    transport
        .listen(&config.node.listen)
        .await
        .with_context(|| format!("Failed to listen on {}", config.node.listen))?;

    let runtime = ClusterRuntime::new(transport.clone(), services, config.query_timeout());
    runtime.add_peers(config.peer_identities());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runtime_task = runtime.spawn(events_rx, shutdown_rx.clone());
    let publisher_task = spawn_snapshot_publisher(
        runtime.snapshot_publisher(config.snapshot_interval()),
        shutdown_rx,
    );

    let dialers: Vec<_> = config
        .peer_identities()
        .into_iter()
        .map(|peer| transport.connect_to(peer, Duration::from_secs(PEER_RETRY_SECS)))
        .collect();

    info!(
        "Node {} started with {} MB for services and {} configured peers",
        identity.id,
        memory_mb,
        config.peers.len()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for shutdown signal")?;

    info!("Shutting down");
    let head = runtime.resolver().head_node();
    println!("{}", format_node_table(&runtime.registry().nodes(), head.id()));

    let _ = shutdown_tx.send(true);
    for dialer in dialers {
        dialer.abort();
    }
    let _ = tokio::join!(runtime_task, publisher_task);
    Ok(())
}

fn init(config_path: Option<PathBuf>, args: &InitArgs) -> Result<()> {
    let path = config_path.unwrap_or_else(default_config_path);
    if path.exists() && !args.force {
        bail!(
            "Config {} already exists, use --force to overwrite",
            path.display()
        );
    }

    let mut config = NodeConfig::default();
    if let Some(ref id) = args.node_id {
        config.node.id = id.clone();
    }
    for peer in &args.peers {
        config.peers.push(parse_peer_arg(peer).map_err(anyhow::Error::msg)?);
    }
    validate_node_config(&config).context("Invalid node config")?;

    save_node_config(&config, &path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote node config for {} to {}", config.node.id, path.display());
    Ok(())
}

/// An explicit path must exist; the default path may be missing
fn load_config(config_path: Option<PathBuf>) -> Result<(PathBuf, NodeConfig)> {
    let config = match &config_path {
        Some(path) => load_node_config(path),
        None => load_node_config_or_default(&default_config_path()),
    };
    let path = config_path.unwrap_or_else(default_config_path);
    let config =
        config.with_context(|| format!("Failed to load node config {}", path.display()))?;
    Ok((path, config))
}
