//! CLI module for cloudmesh
//!
//! Subcommands:
//! - `cloudmesh serve` - Run a cluster node
//! - `cloudmesh init` - Write a starter node config

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

mod display;

pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "cloudmesh")]
#[command(about = "Place cloud services across a cluster of cooperating nodes")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to the node config (default: ~/.cloudmesh/node.yaml)
    #[arg(long, global = true, env = "CLOUDMESH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run this machine as a cluster node
    Serve(ServeArgs),

    /// Write a starter node config
    Init(InitArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Validate the config and print the cluster layout without starting
    #[arg(long)]
    pub dry_run: bool,

    /// Path to a .env file to load before reading the config
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Override the listen address from the config
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Override the node id from the config
    #[arg(long, value_name = "ID")]
    pub node_id: Option<String>,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Node id (default: host name)
    #[arg(long, value_name = "ID")]
    pub node_id: Option<String>,

    /// Peers as ID=ADDRESS, repeatable
    #[arg(long = "peer", value_name = "ID=ADDRESS")]
    pub peers: Vec<String>,

    /// Overwrite an existing config
    #[arg(long)]
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve() {
        let cli = Cli::parse_from(["cloudmesh", "-vv", "serve", "--dry-run", "--node-id", "node-a"]);

        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Serve(args) => {
                assert!(args.dry_run);
                assert_eq!(args.node_id.as_deref(), Some("node-a"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_init_peers() {
        let cli = Cli::parse_from([
            "cloudmesh",
            "init",
            "--peer",
            "node-b=10.0.0.2:4300",
            "--peer",
            "node-c=10.0.0.3:4300",
            "--config",
            "/tmp/node.yaml",
        ]);

        assert_eq!(cli.config, Some(PathBuf::from("/tmp/node.yaml")));
        match cli.command {
            Commands::Init(args) => assert_eq!(args.peers.len(), 2),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
