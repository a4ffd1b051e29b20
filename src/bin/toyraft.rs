//! The toyraft server. It takes configuration via a configuration file, command
//! line parameters, and environment variables, then starts up a Raft node
//! serving a key/value state machine to clients and peers.

#![warn(clippy::all)]

use toyraft::error::Result;
use toyraft::kv::KV;
use toyraft::raft::{self, ClusterRecord, NodeRecord, NodeRole, TransportRecord};
use toyraft::Server;

use clap::Parser as _;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

fn main() {
    if let Err(error) = Command::parse().run() {
        eprintln!("Error: {error}")
    }
}

/// The toyraft server configuration. Can be provided via config file (default
/// config/toyraft.yaml) or TOYRAFT_ environment variables.
#[derive(Debug, Deserialize)]
struct Config {
    /// The node name.
    id: String,
    /// The cluster name.
    cluster: String,
    /// The address to listen on.
    listen: String,
    /// This node's role: peer, promotable, or backup. A node that joined a
    /// running cluster must use the role it joined with.
    role: String,
    /// All cluster nodes, including this one, by name and address.
    peers: HashMap<String, String>,
    /// The data directory. Node data is stored in data_dir/cluster/id.
    data_dir: PathBuf,
    log_level: String,
    fsync: bool,
    segment_size: usize,
    max_append_bytes: usize,
    snapshot_chunk_size: usize,
    snapshot_map_size: usize,
}

impl Config {
    /// Loads the configuration from the given file.
    fn load(file: &str) -> Result<Self> {
        let defaults = raft::Options::default();
        Ok(config::Config::builder()
            .set_default("id", "toyraft")?
            .set_default("cluster", "toyraft")?
            .set_default("listen", "0.0.0.0:9705")?
            .set_default("role", "peer")?
            .set_default("data_dir", "data")?
            .set_default("log_level", "info")?
            .set_default("fsync", true)?
            .set_default("segment_size", defaults.segment_size as u64)?
            .set_default("max_append_bytes", defaults.max_append_bytes as u64)?
            .set_default("snapshot_chunk_size", defaults.snapshot_chunk_size as u64)?
            .set_default("snapshot_map_size", defaults.snapshot_map_size as u64)?
            .add_source(config::File::with_name(file))
            .add_source(config::Environment::with_prefix("TOYRAFT"))
            .build()?
            .try_deserialize()?)
    }

    /// Builds the cluster record from the peer addresses.
    fn cluster_record(&self) -> Result<ClusterRecord> {
        let mut nodes = Vec::new();
        let mut peers: Vec<_> = self.peers.iter().collect();
        peers.sort();
        for (name, address) in peers {
            let address: std::net::SocketAddr = address.parse()?;
            let transport = TransportRecord::tcp(address.ip().to_string(), address.port());
            let role = if *name == self.id { self.role()? } else { NodeRole::Peer };
            nodes.push(NodeRecord::new(name.as_str(), role).with_transport(transport));
        }
        Ok(ClusterRecord::new(self.cluster.as_str(), nodes))
    }

    /// Parses this node's role.
    fn role(&self) -> Result<NodeRole> {
        match self.role.as_str() {
            "peer" => Ok(NodeRole::Peer),
            "promotable" => Ok(NodeRole::Promotable),
            "backup" => Ok(NodeRole::Backup),
            role => toyraft::errinput!("invalid role {role}"),
        }
    }

    /// Returns the Raft node options.
    fn options(&self) -> raft::Options {
        raft::Options {
            fsync: self.fsync,
            segment_size: self.segment_size,
            max_append_bytes: self.max_append_bytes,
            snapshot_chunk_size: self.snapshot_chunk_size,
            snapshot_map_size: self.snapshot_map_size,
            ..raft::Options::default()
        }
    }
}

/// The toyraft server command.
#[derive(clap::Parser)]
#[command(about = "Starts a toyraft server.", version, propagate_version = true)]
struct Command {
    /// The configuration file path.
    #[arg(short = 'c', long, default_value = "config/toyraft.yaml")]
    config: String,
}

impl Command {
    /// Runs the toyraft server.
    fn run(self) -> Result<()> {
        let cfg = Config::load(&self.config)?;

        // Initialize logging.
        let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
        let mut logconfig = simplelog::ConfigBuilder::new();
        if loglevel != simplelog::LevelFilter::Debug {
            logconfig.add_filter_allow_str("toyraft");
        }
        simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

        // Start the Raft server.
        let cluster = cfg.cluster_record()?;
        let Some(node) = cluster.get(&cfg.id).cloned() else {
            return toyraft::errinput!("node {} not in peers", cfg.id);
        };
        let dir = cfg.data_dir.join(&cfg.cluster).join(&cfg.id);
        let listener = std::net::TcpListener::bind(&cfg.listen)?;
        let server = Server::new(&dir, node, cluster, Box::new(KV::new()), cfg.options())?;
        server.serve(listener)
    }
}
