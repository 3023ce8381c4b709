//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use std::path::Path;
use std::sync::Arc;

use crate::cluster::ClusterNode;
use crate::config::{NodeConfig, PeerConfig};

/// Format a table with upper-cased headers and padded columns
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No nodes found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut output = String::new();
    let header_row: Vec<String> = headers.iter().map(|h| h.to_uppercase()).collect();
    for row in std::iter::once(header_row).chain(rows) {
        let cells: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:width$}", cell, width = *width))
            .collect();
        output.push_str(cells.join("   ").trim_end());
        output.push('\n');
    }
    output
}

/// Format the known nodes of a registry, marking the head
pub fn format_node_table(nodes: &[Arc<ClusterNode>], head_id: &str) -> String {
    let rows = nodes
        .iter()
        .map(|node| {
            let (memory, cpu) = match &node.snapshot {
                Some(s) if s.cpu_known() => (
                    format!("{}/{} MB", s.used_memory_mb, s.max_memory_mb),
                    format!("{:.1}%", s.system_cpu_usage),
                ),
                Some(s) => (
                    format!("{}/{} MB", s.used_memory_mb, s.max_memory_mb),
                    "-".to_string(),
                ),
                None => ("-".to_string(), "-".to_string()),
            };
            vec![
                node.id().to_string(),
                node.identity.address.clone(),
                if node.available { "Up" } else { "Down" }.to_string(),
                if node.id() == head_id { "head" } else { "" }.to_string(),
                memory,
                cpu,
            ]
        })
        .collect();

    format_table(&["id", "address", "status", "role", "memory", "cpu"], rows)
}

/// Format the dry-run output for `serve --dry-run`
pub fn format_dry_run(config: &NodeConfig, config_path: &Path, memory_mb: u64) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "cloudmesh v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    output.push_str(&format!("Config: {}\n\n", config_path.display()));

    let identity = config.identity();
    output.push_str("Node:\n");
    output.push_str(&format!("  id:        {}\n", identity.id));
    output.push_str(&format!("  listen:    {}\n", config.node.listen));
    output.push_str(&format!("  advertise: {}\n", identity.address));
    output.push_str(&format!("  memory:    {} MB for services\n", memory_mb));
    output.push_str(&format!(
        "  timeouts:  query {}s, snapshot every {}s\n\n",
        config.query_timeout_secs, config.snapshot_interval_secs
    ));

    output.push_str(&format!("Peers ({}):\n", config.peers.len()));
    for peer in &config.peers {
        output.push_str(&format!("  - {} @ {}\n", peer.id, peer.address));
    }

    // Head as it will be once every configured peer is connected
    let head = config
        .peers
        .iter()
        .map(|p| p.id.as_str())
        .chain(std::iter::once(identity.id.as_str()))
        .min()
        .unwrap_or(identity.id.as_str());
    output.push_str(&format!("\nHead when all peers are up: {}\n", head));

    output
}

/// Parse a `--peer ID=ADDRESS` argument
pub fn parse_peer_arg(arg: &str) -> Result<PeerConfig, String> {
    match arg.split_once('=') {
        Some((id, address)) if !id.trim().is_empty() && !address.trim().is_empty() => {
            Ok(PeerConfig {
                id: id.trim().to_string(),
                address: address.trim().to_string(),
            })
        }
        _ => Err(format!("Invalid peer '{}', expected ID=ADDRESS", arg)),
    }
}
