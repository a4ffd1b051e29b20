use super::{ClusterRecord, Envelope, Message, NodeID, NodeRecord, Sequence, Status};
use crate::encoding::{self, Value as _};
use crate::error::{Error, Result};

use ::log::{debug, info};
use crossbeam::channel::{Receiver, Sender};
use std::io::{BufReader, BufWriter, Write as _};
use std::net::TcpStream;
use std::time::Duration;

/// The number of connection attempts before giving up on finding a leader.
const CONNECT_ATTEMPTS: usize = 50;

/// The delay between connection attempts.
const CONNECT_DELAY: Duration = Duration::from_millis(100);

/// A Raft client. It connects to the cluster leader, registers a session
/// under the client's name, and submits commands to the state machine.
///
/// Commands are retried with the same sequence number when the leader changes
/// or the connection fails, and the session ensures they're applied at most
/// once. Client names must be unique: two clients with the same name share a
/// session, and their requests would be mistaken for retries.
pub struct Client {
    name: NodeID,
    /// The last known cluster record. Updated from connection responses and
    /// publications.
    cluster: ClusterRecord,
    /// The leader connection, if connected.
    conn: Option<Connection>,
    /// The leader hint, tried first when connecting.
    leader: Option<NodeID>,
    /// The last sequence number that was answered.
    sequence: Sequence,
    publish_tx: Sender<ClusterRecord>,
    publish_rx: Receiver<ClusterRecord>,
}

/// A connection to a node.
struct Connection {
    node: NodeID,
    writer: BufWriter<TcpStream>,
    /// Responses, received by a reader thread. Closed when the connection is.
    response_rx: Receiver<Message>,
}

/// The outcome of a connection attempt.
enum Connect {
    /// The node accepted the session.
    Accepted,
    /// The node refused the session, with a leader hint.
    Refused(Option<NodeID>),
}

impl Client {
    /// Connects to the cluster leader, using the addresses of the given
    /// cluster record.
    pub fn connect(name: impl Into<NodeID>, cluster: ClusterRecord) -> Result<Self> {
        let (publish_tx, publish_rx) = crossbeam::channel::unbounded();
        let mut client =
            Self { name: name.into(), cluster, conn: None, leader: None, sequence: 0, publish_tx, publish_rx };
        client.reconnect()?;
        Ok(client)
    }

    /// Returns the node the client is connected to, if any.
    pub fn leader(&self) -> Option<&NodeID> {
        self.conn.as_ref().map(|conn| &conn.node)
    }

    /// Returns a receiver of the cluster records published by the leader.
    pub fn publications(&self) -> Receiver<ClusterRecord> {
        self.publish_rx.clone()
    }

    /// Submits a command to the state machine, returning its result once
    /// applied. Commands that fail to apply return Error::InvalidInput with
    /// the failure message.
    pub fn submit(&mut self, command: Vec<u8>) -> Result<Vec<u8>> {
        let sequence = self.sequence + 1;
        loop {
            if self.conn.is_none() {
                self.reconnect()?;
            }
            let request = Message::ClientRequest { sequence, acknowledge: self.sequence, command: command.clone() };
            let response = self.request(request, |msg| {
                matches!(msg, Message::ClientResponse { sequence: s, .. } if *s == sequence)
            });
            match response {
                Ok(Message::ClientResponse { response: Err(Error::Abort), .. }) => {
                    debug!("Request {sequence} aborted, retrying");
                    self.disconnect(None);
                }
                Ok(Message::ClientResponse { response, .. }) => {
                    self.sequence = sequence;
                    return response;
                }
                Ok(msg) => return Err(Error::InvalidData(format!("unexpected response {msg:?}"))),
                Err(err) => {
                    debug!("Request {sequence} failed, retrying: {err}");
                    let node = self.conn.as_ref().map(|conn| conn.node.clone());
                    self.disconnect(node);
                }
            }
        }
    }

    /// Adds a node to the cluster, or updates a member's group and
    /// transports. Returns the cluster record once the change is applied, and
    /// the node can be started with it. Invalid joins, e.g. changing a
    /// member's role, return Error::InvalidInput.
    pub fn join(&mut self, node: NodeRecord) -> Result<ClusterRecord> {
        loop {
            if self.conn.is_none() {
                self.reconnect()?;
            }
            let request = Message::JoinRequest { node: node.clone() };
            match self.request(request, |msg| matches!(msg, Message::JoinResponse { .. })) {
                Ok(Message::JoinResponse { response: Err(Error::Abort) }) => {
                    debug!("Join of {} aborted, retrying", node.name);
                    self.disconnect(None);
                    std::thread::sleep(CONNECT_DELAY);
                }
                Ok(Message::JoinResponse { response }) => {
                    let cluster = response?;
                    self.cluster = cluster.clone();
                    return Ok(cluster);
                }
                Ok(msg) => return Err(Error::InvalidData(format!("unexpected response {msg:?}"))),
                Err(err) => {
                    debug!("Join of {} failed, retrying: {err}", node.name);
                    let node = self.conn.as_ref().map(|conn| conn.node.clone());
                    self.disconnect(node);
                }
            }
        }
    }

    /// Ends the client's session. The cluster discards its sequence numbers
    /// and cached responses, and a later client with the same name starts a
    /// new session.
    pub fn close(mut self) -> Result<()> {
        loop {
            if self.conn.is_none() {
                self.reconnect()?;
            }
            match self.request(Message::UnregisterRequest, |msg| matches!(msg, Message::UnregisterResponse { .. })) {
                Ok(Message::UnregisterResponse { response: Err(Error::Abort) }) => {
                    debug!("Unregistration aborted, retrying");
                    self.disconnect(None);
                }
                Ok(Message::UnregisterResponse { response }) => {
                    info!("Closed session {}", self.name);
                    return response;
                }
                Ok(msg) => return Err(Error::InvalidData(format!("unexpected response {msg:?}"))),
                Err(err) => {
                    debug!("Unregistration failed, retrying: {err}");
                    let node = self.conn.as_ref().map(|conn| conn.node.clone());
                    self.disconnect(node);
                }
            }
        }
    }

    /// Fetches the status of the connected node.
    pub fn status(&mut self) -> Result<Status> {
        if self.conn.is_none() {
            self.reconnect()?;
        }
        match self.request(Message::StatusRequest, |msg| matches!(msg, Message::StatusResponse { .. }))? {
            Message::StatusResponse { status } => Ok(status),
            msg => Err(Error::InvalidData(format!("unexpected response {msg:?}"))),
        }
    }

    /// Sends a request on the connection, and waits for the matching response.
    /// Other responses are discarded.
    fn request(&mut self, message: Message, matches: impl Fn(&Message) -> bool) -> Result<Message> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::IO("not connected".into()));
        };
        let envelope = Envelope { from: self.name.clone(), to: conn.node.clone(), term: 0, message };
        encoding::bincode::serialize_into(&mut conn.writer, &envelope)?;
        conn.writer.flush()?;
        loop {
            let msg = conn.response_rx.recv()?;
            if matches(&msg) {
                return Ok(msg);
            }
            debug!("Discarding response {msg:?}");
        }
    }

    /// Drops the connection, keeping the given leader hint.
    fn disconnect(&mut self, leader: Option<NodeID>) {
        self.conn = None;
        self.leader = leader;
    }

    /// Connects to the leader. Starts with the leader hint, then follows
    /// redirects, or tries each node in turn.
    fn reconnect(&mut self) -> Result<()> {
        let mut next = 0;
        for _ in 0..CONNECT_ATTEMPTS {
            let node = match self.leader.take() {
                Some(node) => node,
                None => {
                    let nodes: Vec<_> = self
                        .cluster
                        .peers
                        .iter()
                        .filter(|n| n.role.is_replica() && !n.transports.is_empty())
                        .map(|n| n.name.clone())
                        .collect();
                    if nodes.is_empty() {
                        return Err(Error::InvalidInput(format!("no nodes in cluster {}", self.cluster.name)));
                    }
                    next += 1;
                    nodes[(next - 1) % nodes.len()].clone()
                }
            };
            match self.try_connect(&node) {
                Ok(Connect::Accepted) => {
                    info!("Connected to leader {node}");
                    return Ok(());
                }
                Ok(Connect::Refused(Some(leader))) if leader != node => {
                    debug!("Node {node} redirected to leader {leader}");
                    self.leader = Some(leader);
                    continue;
                }
                Ok(Connect::Refused(leader)) => {
                    debug!("Node {node} refused connection");
                    // A leader that hasn't started its term yet, retry it.
                    self.leader = leader;
                }
                Err(err) => debug!("Failed connecting to {node}: {err}"),
            }
            std::thread::sleep(CONNECT_DELAY);
        }
        Err(Error::IO(format!("no leader found in cluster {}", self.cluster.name)))
    }

    /// Attempts to register a session with the given node.
    fn try_connect(&mut self, node: &str) -> Result<Connect> {
        let Some(transport) = self.cluster.get(node).and_then(|n| n.transports.first()) else {
            return Err(Error::InvalidInput(format!("no transport for node {node}")));
        };
        let socket = TcpStream::connect(transport.address())?;
        socket.set_nodelay(true)?;
        let reader = BufReader::new(socket.try_clone()?);
        let (response_tx, response_rx) = crossbeam::channel::unbounded();
        let publish_tx = self.publish_tx.clone();
        std::thread::spawn(move || Self::receive(reader, response_tx, publish_tx));

        self.conn = Some(Connection { node: node.to_string(), writer: BufWriter::new(socket), response_rx });
        let request = Message::ConnectRequest { cluster: self.cluster.name.clone(), client: true };
        let (success, leader, cluster, sequence) =
            match self.request(request, |msg| matches!(msg, Message::ConnectResponse { .. })) {
                Ok(Message::ConnectResponse { success, leader, cluster, sequence, .. }) => {
                    (success, leader, cluster, sequence)
                }
                Ok(msg) => {
                    self.conn = None;
                    return Err(Error::InvalidData(format!("unexpected response {msg:?}")));
                }
                Err(err) => {
                    self.conn = None;
                    return Err(err);
                }
            };
        if cluster.name == self.cluster.name {
            self.cluster = cluster;
        }
        if !success {
            self.conn = None;
            return Ok(Connect::Refused(leader));
        }
        // A previous client with this name may have submitted requests.
        self.sequence = self.sequence.max(sequence);
        Ok(Connect::Accepted)
    }

    /// Receives messages from a node, routing publications separately.
    fn receive(mut reader: BufReader<TcpStream>, response_tx: Sender<Message>, publish_tx: Sender<ClusterRecord>) {
        loop {
            match Envelope::maybe_decode_from(&mut reader) {
                Ok(Some(Envelope { message: Message::Publish { cluster }, .. })) => {
                    if publish_tx.send(cluster).is_err() {
                        return;
                    }
                }
                Ok(Some(envelope)) => {
                    if response_tx.send(envelope.message).is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    debug!("Connection failed: {err}");
                    return;
                }
            }
        }
    }
}
