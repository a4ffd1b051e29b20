//! toykv is a command-line client for the toyraft key/value state machine. It
//! connects to the cluster leader and runs a single command.

#![warn(clippy::all)]

use toyraft::encoding::Value as _;
use toyraft::error::Result;
use toyraft::kv::{self, KV};
use toyraft::raft::{ClusterRecord, NodeRecord, NodeRole, TransportRecord};
use toyraft::Client;

use clap::Parser as _;

fn main() {
    if let Err(error) = Command::parse().run() {
        eprintln!("Error: {error}")
    }
}

/// The toykv command.
#[derive(clap::Parser)]
#[command(about = "A toyraft key/value client.", version, propagate_version = true)]
struct Command {
    /// The client name. Must be unique among concurrent clients.
    #[arg(short = 'n', long, default_value = "toykv")]
    name: String,
    /// The cluster name.
    #[arg(long, default_value = "toyraft")]
    cluster: String,
    /// Cluster node addresses, as host:port.
    #[arg(short = 'a', long = "address", default_value = "127.0.0.1:9705")]
    addresses: Vec<String>,
    #[command(subcommand)]
    op: Op,
}

/// A key/value operation.
#[derive(clap::Subcommand)]
enum Op {
    /// Fetches a key.
    Get { key: String },
    /// Sets a key.
    Set { key: String, value: String },
    /// Deletes a key.
    Delete { key: String },
    /// Prints the leader's status.
    Status,
    /// Adds a node to the cluster, and prints the cluster record to start it
    /// with.
    Join {
        /// The node name.
        node: String,
        /// The node's address, as host:port.
        address: String,
        /// Join as a voter instead of a promotable replica.
        #[arg(long)]
        voter: bool,
    },
}

impl Command {
    /// Runs the command.
    fn run(self) -> Result<()> {
        // Node names are placeholders until the client learns the cluster
        // record from the first node it reaches.
        let mut nodes = Vec::new();
        for (i, address) in self.addresses.iter().enumerate() {
            let address: std::net::SocketAddr = address.parse()?;
            let transport = TransportRecord::tcp(address.ip().to_string(), address.port());
            nodes.push(NodeRecord::new(format!("seed{i}"), NodeRole::Peer).with_transport(transport));
        }
        let mut client = Client::connect(self.name, ClusterRecord::new(self.cluster, nodes))?;

        let command = match self.op {
            Op::Get { key } => kv::Command::Get(key),
            Op::Set { key, value } => kv::Command::Set { key, value: value.into_bytes() },
            Op::Delete { key } => kv::Command::Delete(key),
            Op::Status => {
                println!("{:#?}", client.status()?);
                return client.close();
            }
            Op::Join { node, address, voter } => {
                let address: std::net::SocketAddr = address.parse()?;
                let transport = TransportRecord::tcp(address.ip().to_string(), address.port());
                let role = if voter { NodeRole::Peer } else { NodeRole::Promotable };
                let record = client.join(NodeRecord::new(node, role).with_transport(transport))?;
                println!("{record:#?}");
                return client.close();
            }
        };
        match KV::decode_value(&client.submit(command.encode()?)?)? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(none)"),
        }
        client.close()
    }
}
