//! Runs real toyraft servers over TCP, and submits commands with the client.

use toyraft::encoding::Value as _;
use toyraft::error::Result;
use toyraft::kv::{self, KV};
use toyraft::raft::{ClusterRecord, NodeRecord, NodeRole, Options, TransportRecord};
use toyraft::{Client, Server};

use crossbeam::channel::Sender;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::net::TcpListener;
use std::time::{Duration, Instant};

/// Timeout for the cluster to elect a leader.
const TIMEOUT: Duration = Duration::from_secs(30);

/// A test cluster, running servers on background threads. Servers stop when
/// the cluster is dropped.
struct TestCluster {
    record: ClusterRecord,
    opts: Options,
    /// Dropping a sender stops its server.
    shutdown: HashMap<String, Sender<()>>,
    dir: tempfile::TempDir, // deleted when dropped
}

impl TestCluster {
    /// Starts a cluster with the given number of nodes on random ports.
    fn run(nodes: usize) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("toyraft").tempdir()?;
        let mut listeners = Vec::new();
        let mut records = Vec::new();
        for i in 1..=nodes {
            let (listener, transport) = listen()?;
            records.push(NodeRecord::new(format!("n{i}"), NodeRole::Peer).with_transport(transport));
            listeners.push(listener);
        }
        let record = ClusterRecord::new("test", records);
        let opts = Options { fsync: false, segment_size: 64 * 1024, ..Options::default() };

        let mut cluster = Self { record: record.clone(), opts, shutdown: HashMap::new(), dir };
        for (node, listener) in record.peers.iter().zip(listeners) {
            cluster.start(node.clone(), record.clone(), listener)?;
        }
        Ok(cluster)
    }

    /// Starts a server for the node on the listener.
    fn start(&mut self, node: NodeRecord, record: ClusterRecord, listener: TcpListener) -> Result<()> {
        let path = self.dir.path().join(&node.name);
        let server = Server::new(&path, node.clone(), record, Box::new(KV::new()), self.opts.clone())?;
        let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded(0);
        self.shutdown.insert(node.name, shutdown_tx);
        std::thread::spawn(move || server.serve_until(listener, shutdown_rx));
        Ok(())
    }

    /// Stops a node's server. Its listener keeps accepting connections, but
    /// they're closed once anything is sent on them.
    fn stop(&mut self, name: &str) {
        self.shutdown.remove(name);
    }

    /// Connects a client, waiting for a leader to be elected.
    fn connect(&self, name: &str) -> Result<Client> {
        connect(name, self.record.clone())
    }
}

/// Binds a listener on a random port.
fn listen() -> Result<(TcpListener, TransportRecord)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    Ok((listener, TransportRecord::tcp("127.0.0.1", port)))
}

/// Connects a client with the given cluster record, waiting for a leader to
/// be elected.
fn connect(name: &str, record: ClusterRecord) -> Result<Client> {
    let started = Instant::now();
    loop {
        match Client::connect(name, record.clone()) {
            Ok(client) => return Ok(client),
            Err(err) if started.elapsed() >= TIMEOUT => return Err(err),
            Err(_) => std::thread::sleep(Duration::from_millis(100)),
        }
    }
}

/// Runs a client operation until it succeeds or the timeout is reached.
fn retry<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let started = Instant::now();
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if started.elapsed() >= TIMEOUT => return Err(err),
            Err(_) => std::thread::sleep(Duration::from_millis(100)),
        }
    }
}

/// Submits a key/value command.
fn submit(client: &mut Client, command: kv::Command) -> Result<kv::Value> {
    KV::decode_value(&client.submit(command.encode()?)?)
}

#[test]
fn submit_and_read() -> Result<()> {
    let cluster = TestCluster::run(3)?;
    let mut client = cluster.connect("client")?;

    assert_eq!(submit(&mut client, kv::Command::Set { key: "a".into(), value: b"1".to_vec() })?, None);
    assert_eq!(submit(&mut client, kv::Command::Set { key: "a".into(), value: b"2".to_vec() })?, Some(b"1".to_vec()));
    assert_eq!(submit(&mut client, kv::Command::Get("a".into()))?, Some(b"2".to_vec()));
    assert_eq!(submit(&mut client, kv::Command::Delete("a".into()))?, Some(b"2".to_vec()));
    assert_eq!(submit(&mut client, kv::Command::Get("a".into()))?, None);

    // Failed commands return input errors, and the client can continue.
    assert!(matches!(
        submit(&mut client, kv::Command::Set { key: String::new(), value: vec![] }),
        Err(toyraft::Error::InvalidInput(_))
    ));
    assert_eq!(submit(&mut client, kv::Command::Get("a".into()))?, None);
    Ok(())
}

#[test]
fn status_reports_leader() -> Result<()> {
    let cluster = TestCluster::run(3)?;
    let mut client = cluster.connect("client")?;
    submit(&mut client, kv::Command::Set { key: "a".into(), value: b"1".to_vec() })?;

    let status = client.status()?;
    assert_eq!(status.role, "leader");
    assert_eq!(Some(&status.node), client.leader());
    assert_eq!(status.leader.as_ref(), Some(&status.node));
    assert_eq!(status.sessions, 1);
    assert_eq!(status.cluster.get(&status.node).map(|n| n.role), Some(NodeRole::Leader));
    Ok(())
}

#[test]
fn session_resumes_after_reconnect() -> Result<()> {
    let cluster = TestCluster::run(3)?;
    let mut client = cluster.connect("client")?;
    submit(&mut client, kv::Command::Set { key: "a".into(), value: b"1".to_vec() })?;
    submit(&mut client, kv::Command::Set { key: "b".into(), value: b"2".to_vec() })?;
    drop(client);

    // A new client with the same name picks up the session, and its requests
    // aren't mistaken for retries of the previous ones.
    let mut client = cluster.connect("client")?;
    assert_eq!(submit(&mut client, kv::Command::Set { key: "a".into(), value: b"3".to_vec() })?, Some(b"1".to_vec()));
    assert_eq!(submit(&mut client, kv::Command::Get("b".into()))?, Some(b"2".to_vec()));
    assert_eq!(client.status()?.sessions, 1);
    Ok(())
}

#[test]
fn single_node_cluster() -> Result<()> {
    let cluster = TestCluster::run(1)?;
    let mut client = cluster.connect("client")?;
    submit(&mut client, kv::Command::Set { key: "a".into(), value: b"1".to_vec() })?;
    assert_eq!(submit(&mut client, kv::Command::Get("a".into()))?, Some(b"1".to_vec()));
    Ok(())
}

#[test]
fn publishes_connectivity_changes() -> Result<()> {
    let mut cluster = TestCluster::run(3)?;
    let mut client = cluster.connect("client")?;
    submit(&mut client, kv::Command::Set { key: "a".into(), value: b"1".to_vec() })?;
    let publications = client.publications();

    let leader = client.leader().cloned().expect("not connected");
    let follower = cluster.record.peers.iter().map(|n| n.name.clone()).find(|n| *n != leader).expect("no follower");
    cluster.stop(&follower);

    // Earlier publications may be queued, wait for the one without the
    // follower.
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let record = publications.recv_deadline(deadline).expect("no publication");
        if record.get(&follower).is_some_and(|n| !n.connected) {
            assert_eq!(record.get(&leader).map(|n| n.role), Some(NodeRole::Leader));
            break;
        }
    }

    // The cluster still has a quorum.
    assert_eq!(submit(&mut client, kv::Command::Get("a".into()))?, Some(b"1".to_vec()));
    Ok(())
}

#[test]
fn follows_redirect_to_leader() -> Result<()> {
    let cluster = TestCluster::run(3)?;
    let leader = cluster.connect("client")?.status()?.node;

    // The client only knows a follower's address, and learns the leader's
    // from the follower's redirect.
    let mut record = cluster.record.clone();
    let follower = record.peers.iter().map(|n| n.name.clone()).find(|n| *n != leader).expect("no follower");
    for node in record.peers.iter_mut().filter(|n| n.name != follower) {
        node.transports.clear();
    }
    let mut client = connect("redirected", record)?;
    assert_eq!(client.leader(), Some(&leader));
    assert_eq!(submit(&mut client, kv::Command::Set { key: "a".into(), value: b"1".to_vec() })?, None);
    Ok(())
}

#[test]
fn fails_over_to_new_leader() -> Result<()> {
    let mut cluster = TestCluster::run(3)?;
    let mut client = cluster.connect("client")?;
    submit(&mut client, kv::Command::Set { key: "a".into(), value: b"1".to_vec() })?;
    let old_leader = client.leader().cloned().expect("not connected");
    cluster.stop(&old_leader);

    // The client keeps its session across the leader change, so the retried
    // write is applied once.
    let command = kv::Command::Set { key: "a".into(), value: b"2".to_vec() };
    assert_eq!(retry(|| submit(&mut client, command.clone()))?, Some(b"1".to_vec()));
    let new_leader = client.leader().cloned().expect("not connected");
    assert_ne!(new_leader, old_leader);
    assert_eq!(submit(&mut client, kv::Command::Get("a".into()))?, Some(b"2".to_vec()));
    assert_eq!(client.status()?.node, new_leader);
    Ok(())
}

#[test]
fn close_ends_session() -> Result<()> {
    let cluster = TestCluster::run(3)?;
    let mut a = cluster.connect("a")?;
    let mut b = cluster.connect("b")?;
    submit(&mut a, kv::Command::Set { key: "x".into(), value: b"1".to_vec() })?;
    assert_eq!(b.status()?.sessions, 2);

    a.close()?;
    assert_eq!(b.status()?.sessions, 1);

    // A client with the same name gets a new session, and the data remains.
    let mut a = cluster.connect("a")?;
    assert_eq!(submit(&mut a, kv::Command::Get("x".into()))?, Some(b"1".to_vec()));
    assert_eq!(b.status()?.sessions, 2);
    Ok(())
}

#[test]
fn joined_node_catches_up() -> Result<()> {
    let mut cluster = TestCluster::run(3)?;
    let mut client = cluster.connect("client")?;
    for i in 0..10 {
        submit(&mut client, kv::Command::Set { key: format!("k{i}"), value: b"v".to_vec() })?;
    }

    let (listener, transport) = listen()?;
    let node = NodeRecord::new("n4", NodeRole::Promotable).with_transport(transport);
    let record = client.join(node.clone())?;
    assert_eq!(record.get("n4").map(|n| n.role), Some(NodeRole::Promotable));
    cluster.start(node, record, listener)?;

    // The leader marks n4 connected once it answers, and replicates the log
    // to it.
    retry(|| {
        let status = client.status()?;
        let index = status.match_index.get("n4").copied();
        let connected = status.cluster.get("n4").is_some_and(|n| n.connected);
        if connected && index == Some(status.log.last_index) {
            return Ok(());
        }
        Err(toyraft::Error::IO(format!("n4 at {index:?}, leader at {}", status.log.last_index)))
    })?;
    Ok(())
}
