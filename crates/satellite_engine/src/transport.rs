//! Transport layer abstraction for replication sessions.

use crate::error::{SatelliteError, SatelliteResult};
use async_trait::async_trait;
use satellite_protocol::SatelliteMessage;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// Frames travelling in one direction.
pub type FrameSender = mpsc::Sender<Vec<u8>>;

/// Frames arriving from the other side. `None` from `recv` is the closed
/// event.
pub type FrameReceiver = mpsc::Receiver<Vec<u8>>;

/// One open connection to the peer.
///
/// The sender is bounded: a full channel suspends the writer until the peer
/// catches up.
#[derive(Debug)]
pub struct Connection {
    /// Outbound frames.
    pub sender: FrameSender,
    /// Inbound frames.
    pub receiver: FrameReceiver,
}

impl Connection {
    /// Creates two connected ends with `capacity` frames of buffering each
    /// way.
    pub fn pair(capacity: usize) -> (Connection, Connection) {
        let (to_b, from_a) = mpsc::channel(capacity.max(1));
        let (to_a, from_b) = mpsc::channel(capacity.max(1));
        (
            Connection {
                sender: to_b,
                receiver: from_b,
            },
            Connection {
                sender: to_a,
                receiver: from_a,
            },
        )
    }

    /// Encodes and sends a message, waiting for buffer space.
    pub async fn send(&self, message: &SatelliteMessage) -> SatelliteResult<()> {
        let frame = message.encode()?;
        self.sender
            .send(frame)
            .await
            .map_err(|_| SatelliteError::transport_retryable("connection closed while sending"))
    }

    /// Receives and decodes the next message. `Ok(None)` means the peer
    /// closed the connection.
    pub async fn recv(&mut self) -> SatelliteResult<Option<SatelliteMessage>> {
        match self.receiver.recv().await {
            Some(frame) => Ok(Some(SatelliteMessage::decode(&frame)?)),
            None => Ok(None),
        }
    }
}

/// Opens connections to the replication peer.
///
/// This trait abstracts the network layer so sessions can run over sockets,
/// in-process channels, or test fixtures alike.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a new connection.
    async fn connect(&self) -> SatelliteResult<Connection>;
}

/// Server-side ends of connections opened through a [`MemoryTransport`].
pub type Acceptor = mpsc::UnboundedReceiver<(FrameSender, FrameReceiver)>;

/// In-process transport handing each connection to an acceptor channel.
#[derive(Debug)]
pub struct MemoryTransport {
    acceptor: mpsc::UnboundedSender<(FrameSender, FrameReceiver)>,
    capacity: usize,
    available: AtomicBool,
    attempts: AtomicUsize,
}

impl MemoryTransport {
    /// Creates a transport and the acceptor on which a peer receives its
    /// ends of new connections.
    pub fn new(capacity: usize) -> (Self, Acceptor) {
        let (acceptor, accepted) = mpsc::unbounded_channel();
        let transport = Self {
            acceptor,
            capacity,
            available: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
        };
        (transport, accepted)
    }

    /// Makes subsequent connection attempts succeed or fail.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of connection attempts so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> SatelliteResult<Connection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(SatelliteError::transport_retryable("connection refused"));
        }
        let (client, server) = Connection::pair(self.capacity);
        self.acceptor
            .send((server.sender, server.receiver))
            .map_err(|_| SatelliteError::transport_retryable("peer is not accepting"))?;
        Ok(client)
    }
}
