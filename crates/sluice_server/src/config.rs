//! Node configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

/// Runtime configuration for one Sluice node.
#[derive(Parser, Clone, Debug, Deserialize)]
#[command(name = "sluice-node", about = "Sluice streaming SQL database node")]
pub struct NodeConfig {
    /// This node's id; must appear in `node_ids`.
    #[arg(long)]
    pub node_id: u64,

    /// All node ids in the cluster, comma separated. Shard processors are
    /// derived from this list, so every node must pass the same value.
    #[arg(long, value_delimiter = ',', default_value = "0")]
    pub node_ids: Vec<u64>,

    /// Number of shards; fixed at cluster bootstrap.
    #[arg(long, default_value_t = 16)]
    pub num_shards: u64,

    /// gRPC API listen address.
    #[arg(long, default_value = "127.0.0.1:6584")]
    pub api_listen: SocketAddr,

    /// Prometheus exporter bind address.
    #[arg(long, default_value = "127.0.0.1:9102")]
    pub metrics_bind: SocketAddr,

    /// Data directory for the KV store.
    #[arg(long, default_value = "sluice-data")]
    pub data_dir: PathBuf,

    /// Staging directory for snapshot ingest.
    #[arg(long)]
    pub ingest_dir: Option<PathBuf>,

    /// Relaxes the shard-prefix sanity check in the state machine.
    #[arg(long)]
    pub test_mode: bool,
}

impl NodeConfig {
    /// Resolved ingest directory (defaults to `<data_dir>/ingest`).
    pub fn ingest_dir(&self) -> PathBuf {
        self.ingest_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("ingest"))
    }

    /// A single-node config rooted at `data_dir`, used by tests and
    /// embedded setups.
    pub fn single_node(data_dir: PathBuf) -> NodeConfig {
        NodeConfig {
            node_id: 0,
            node_ids: vec![0],
            num_shards: 4,
            api_listen: "127.0.0.1:0".parse().expect("static addr"),
            metrics_bind: "127.0.0.1:0".parse().expect("static addr"),
            data_dir,
            ingest_dir: None,
            test_mode: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.node_ids.contains(&self.node_id),
            "node id {} is not in node_ids {:?}",
            self.node_id,
            self.node_ids
        );
        anyhow::ensure!(self.num_shards > 0, "num_shards must be positive");
        Ok(())
    }
}
