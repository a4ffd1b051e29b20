use super::{ClusterRecord, Envelope, Message, Node, NodeID, NodeRecord, Options, State, TICK_INTERVAL};
use crate::encoding::{self, Value as _};
use crate::errinput;
use crate::error::Result;

use ::log::{debug, error, info, warn};
use crossbeam::channel::{Receiver, Sender, TryRecvError};
use rand::Rng as _;
use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Write as _};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::time::Duration;

/// The capacity of the inbound event queue. Connection threads block when it
/// is full.
const INBOUND_CAPACITY: usize = 1000;

/// The capacity of each outbound connection queue. Messages are discarded
/// when it is full.
const OUTBOUND_CAPACITY: usize = 1000;

/// The initial delay before reconnecting to a peer.
const RECONNECT_MIN: Duration = Duration::from_millis(50);

/// The maximum delay before reconnecting to a peer.
const RECONNECT_MAX: Duration = Duration::from_secs(5);

/// An event from a connection thread to the event loop.
#[derive(Debug)]
enum Event {
    /// A message from a peer or client.
    Message(Envelope),
    /// An outbound connection to a peer was established.
    Connected(NodeID),
    /// An outbound connection to a peer was lost.
    Disconnected(NodeID),
    /// A client connected. Messages to it go to the sender.
    ClientConnected(NodeID, Sender<Envelope>),
    /// A client disconnected. The sender identifies the connection, since the
    /// client may have reconnected already.
    ClientDisconnected(NodeID, Sender<Envelope>),
}

/// A Raft server. It runs a Raft node in an event loop, and connects it to
/// peers and clients via TCP. Peer connections are unidirectional: each node
/// dials every peer and only writes to the connection, and reads messages from
/// the connections its peers dialed. Client connections are bidirectional.
///
/// Peers are dialed at the first transport in their node record. Nodes that
/// join the cluster later are dialed once the join is applied.
pub struct Server {
    node: Node,
    node_rx: Receiver<Envelope>,
}

impl Server {
    /// Creates a new Raft server, opening the node in the given directory.
    pub fn new(
        dir: &Path,
        node: NodeRecord,
        cluster: ClusterRecord,
        state: Box<dyn State>,
        opts: Options,
    ) -> Result<Self> {
        if let Some(peer) = cluster
            .peers
            .iter()
            .find(|n| n.name != node.name && n.role.is_replica() && n.transports.is_empty())
        {
            return errinput!("no transport for node {}", peer.name);
        }
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let node = Node::new(dir, node, cluster, state, node_tx, opts)?;
        Ok(Self { node, node_rx })
    }

    /// Serves peers and clients on the listener. Only returns on a fatal
    /// error, which stops the node.
    pub fn serve(self, listener: TcpListener) -> Result<()> {
        self.serve_until(listener, crossbeam::channel::never())
    }

    /// Like serve(), but also stops the node when the shutdown channel
    /// receives a message or is closed. Connections are closed as the
    /// connection threads notice.
    pub fn serve_until(self, listener: TcpListener, shutdown_rx: Receiver<()>) -> Result<()> {
        info!("Serving Raft node {} on {}", self.node.id(), listener.local_addr()?);
        let (event_tx, event_rx) = crossbeam::channel::bounded(INBOUND_CAPACITY);
        let receive_tx = event_tx.clone();
        std::thread::spawn(move || Self::tcp_receive(listener, receive_tx));

        let result = Self::eventloop(self.node, self.node_rx, event_tx, event_rx, shutdown_rx);
        if let Err(err) = &result {
            error!("Raft node failed: {err}");
        }
        result
    }

    /// Runs the event loop. Outbound messages are routed to peer or client
    /// connections, and the log is maintained after every event.
    fn eventloop(
        mut node: Node,
        node_rx: Receiver<Envelope>,
        event_tx: Sender<Event>,
        event_rx: Receiver<Event>,
        shutdown_rx: Receiver<()>,
    ) -> Result<()> {
        let ticker = crossbeam::channel::tick(TICK_INTERVAL);
        let mut peer_txs: HashMap<NodeID, Sender<Envelope>> = HashMap::new();
        let mut clients: HashMap<NodeID, Sender<Envelope>> = HashMap::new();
        Self::dial_peers(&node, &mut peer_txs, &event_tx);
        loop {
            crossbeam::select! {
                recv(ticker) -> _ => {
                    node = node.tick()?;
                    node.maintain()?;
                }

                recv(shutdown_rx) -> _ => {
                    info!("Shutting down Raft node {}", node.id());
                    return Ok(());
                }

                recv(event_rx) -> event => {
                    match event? {
                        // Clients may not know our name.
                        Event::Message(mut msg) if clients.contains_key(&msg.from) => {
                            msg.to = node.id().clone();
                            node = node.step(msg)?;
                        }
                        Event::Message(msg) if &msg.to != node.id() => {
                            warn!("Dropping message for other node {}", msg.to);
                        }
                        Event::Message(msg) => node = node.step(msg)?,
                        Event::Connected(peer) => node.connected(&peer)?,
                        Event::Disconnected(peer) => node.disconnected(&peer)?,
                        Event::ClientConnected(client, tx) => {
                            debug!("Client {client} connected");
                            clients.insert(client, tx);
                        }
                        Event::ClientDisconnected(client, tx) => {
                            if clients.get(&client).is_some_and(|current| current.same_channel(&tx)) {
                                debug!("Client {client} disconnected");
                                clients.remove(&client);
                                node.disconnected(&client)?;
                            }
                        }
                    }
                    node.maintain()?;
                    Self::dial_peers(&node, &mut peer_txs, &event_tx);
                }

                recv(node_rx) -> msg => {
                    let msg = msg?;
                    let to = msg.to.clone();
                    match peer_txs.get(&to).or_else(|| clients.get(&to)) {
                        Some(tx) => {
                            if tx.try_send(msg).is_err() {
                                warn!("Full or closed send buffer for {to}, discarding message");
                            }
                        }
                        None => debug!("Discarding message to unknown recipient {to}"),
                    }
                }
            }
        }
    }

    /// Starts sender threads for members of the applied cluster record that
    /// don't have one yet. Sender threads exit when the event loop drops their
    /// channel.
    fn dial_peers(node: &Node, peer_txs: &mut HashMap<NodeID, Sender<Envelope>>, event_tx: &Sender<Event>) {
        for record in &node.cluster().peers {
            if &record.name == node.id() || !record.role.is_replica() || peer_txs.contains_key(&record.name) {
                continue;
            }
            let Some(transport) = record.transports.first() else { continue };
            let (id, addr) = (record.name.clone(), transport.address());
            let (tx, rx) = crossbeam::channel::bounded(OUTBOUND_CAPACITY);
            peer_txs.insert(id.clone(), tx);
            let event_tx = event_tx.clone();
            std::thread::spawn(move || Self::tcp_send_peer(id, addr, rx, event_tx));
        }
    }

    /// Accepts inbound connections from peers and clients.
    fn tcp_receive(listener: TcpListener, event_tx: Sender<Event>) {
        std::thread::scope(|s| loop {
            let (socket, addr) = match listener.accept() {
                Ok(r) => r,
                Err(err) => {
                    error!("Connection failed: {err}");
                    continue;
                }
            };
            let event_tx = event_tx.clone();
            s.spawn(move || {
                debug!("Connection from {addr}");
                match Self::tcp_receive_session(socket, event_tx) {
                    Ok(()) => debug!("Connection from {addr} closed"),
                    Err(err) => error!("Connection from {addr} failed: {err}"),
                }
            });
        });
    }

    /// Receives inbound messages on a connection. If the first message is a
    /// client ConnectRequest, the connection belongs to the client, and
    /// responses are written back to it.
    fn tcp_receive_session(socket: TcpStream, event_tx: Sender<Event>) -> Result<()> {
        socket.set_nodelay(true)?;
        let mut reader = BufReader::new(socket.try_clone()?);
        let Some(first) = Envelope::maybe_decode_from(&mut reader)? else {
            return Ok(());
        };
        if !matches!(first.message, Message::ConnectRequest { client: true, .. }) {
            event_tx.send(Event::Message(first))?;
            while let Some(msg) = Envelope::maybe_decode_from(&mut reader)? {
                event_tx.send(Event::Message(msg))?;
            }
            return Ok(());
        }

        // The writer exits once the event loop drops the client's sender on
        // disconnect.
        let client = first.from.clone();
        let (client_tx, client_rx) = crossbeam::channel::bounded(OUTBOUND_CAPACITY);
        event_tx.send(Event::ClientConnected(client.clone(), client_tx.clone()))?;
        std::thread::spawn(move || Self::tcp_send_session(socket, client_rx));
        let result = Self::tcp_receive_client(&client, first, reader, &event_tx);
        event_tx.send(Event::ClientDisconnected(client, client_tx))?;
        result
    }

    /// Receives messages from a client. The sender is always the client the
    /// connection was opened for.
    fn tcp_receive_client(
        client: &str,
        first: Envelope,
        mut reader: BufReader<TcpStream>,
        event_tx: &Sender<Event>,
    ) -> Result<()> {
        event_tx.send(Event::Message(first))?;
        while let Some(mut msg) = Envelope::maybe_decode_from(&mut reader)? {
            if msg.message.is_raft() {
                warn!("Dropping Raft message from client {client}");
                continue;
            }
            msg.from = client.to_string();
            event_tx.send(Event::Message(msg))?;
        }
        Ok(())
    }

    /// Sends outbound messages to a peer, continuously reconnecting with a
    /// randomized exponential backoff.
    fn tcp_send_peer(peer: NodeID, addr: String, out_rx: Receiver<Envelope>, event_tx: Sender<Event>) {
        let mut delay = RECONNECT_MIN;
        loop {
            match TcpStream::connect(&addr) {
                Ok(socket) => {
                    debug!("Connected to peer {peer} at {addr}");
                    delay = RECONNECT_MIN;
                    if event_tx.send(Event::Connected(peer.clone())).is_err() {
                        return;
                    }
                    match Self::tcp_send_session(socket, out_rx.clone()) {
                        Ok(()) => return,
                        Err(err) => error!("Failed sending to peer {peer}: {err}"),
                    }
                    if event_tx.send(Event::Disconnected(peer.clone())).is_err() {
                        return;
                    }
                }
                Err(err) => debug!("Failed connecting to peer {peer} at {addr}: {err}"),
            }
            // Exit once the event loop is gone. A queued message may be lost.
            if let Err(TryRecvError::Disconnected) = out_rx.try_recv() {
                return;
            }
            std::thread::sleep(jitter(delay));
            delay = (delay * 2).min(RECONNECT_MAX);
        }
    }

    /// Writes outbound messages to a connection, until the channel closes or
    /// the write fails.
    fn tcp_send_session(socket: TcpStream, out_rx: Receiver<Envelope>) -> Result<()> {
        socket.set_nodelay(true)?;
        let mut writer = BufWriter::new(socket);
        while let Ok(msg) = out_rx.recv() {
            encoding::bincode::serialize_into(&mut writer, &msg)?;
            // Batch up queued messages before flushing.
            while let Ok(msg) = out_rx.try_recv() {
                encoding::bincode::serialize_into(&mut writer, &msg)?;
            }
            writer.flush()?;
        }
        Ok(())
    }
}

/// Randomizes a delay to between half and all of it.
fn jitter(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
}
