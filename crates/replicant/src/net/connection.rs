use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use super::config::TransportConfig;
use super::frame::{Channel, FrameFlags, FrameHeader, encode_frame};
use super::reliability::{ReliableReceiver, ReliableSender, UnreliableSequencer, WindowFull};
use super::stats::NetworkStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    pub const LOOPBACK: Self = Self(0);
    pub const UNASSIGNED: Self = Self(u32::MAX);
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Remote(SocketAddr),
    /// The host's own client, served in-process.
    Loopback,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Remote(addr) => write!(f, "{}", addr),
            Endpoint::Loopback => write!(f, "loopback"),
        }
    }
}

#[derive(Debug)]
struct ConnectionInner {
    state: ConnectionState,
    last_send: Instant,
    last_receive: Instant,
    reliable_tx: ReliableSender,
    reliable_rx: ReliableReceiver,
    unreliable: UnreliableSequencer,
    stats: NetworkStats,
    connect_attempts: u32,
}

/// Frames that became deliverable after processing one inbound datagram.
#[derive(Debug, Default)]
pub struct Inbound {
    pub delivered: Vec<(FrameFlags, Vec<u8>)>,
    pub needs_ack: bool,
}

#[derive(Debug)]
pub struct Connection {
    id: AtomicU32,
    endpoint: Endpoint,
    inner: Mutex<ConnectionInner>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        endpoint: Endpoint,
        state: ConnectionState,
        config: &TransportConfig,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: AtomicU32::new(id.0),
            endpoint,
            inner: Mutex::new(ConnectionInner {
                state,
                last_send: now,
                last_receive: now,
                reliable_tx: ReliableSender::new(config.send_window),
                reliable_rx: ReliableReceiver::new(config.send_window as u32),
                unreliable: UnreliableSequencer::new(),
                stats: NetworkStats::default(),
                connect_attempts: 0,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> ConnectionId {
        ConnectionId(self.id.load(Ordering::Acquire))
    }

    pub(crate) fn assign_id(&self, id: ConnectionId) {
        self.id.store(id.0, Ordering::Release);
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        match self.endpoint {
            Endpoint::Remote(addr) => Some(addr),
            Endpoint::Loopback => None,
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.endpoint == Endpoint::Loopback
    }

    pub fn state(&self) -> ConnectionState {
        self.inner().state
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.inner().state = state;
    }

    pub fn is_live(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn last_send(&self) -> Instant {
        self.inner().last_send
    }

    pub fn last_receive(&self) -> Instant {
        self.inner().last_receive
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.inner().last_receive.elapsed() > timeout
    }

    pub fn stats(&self) -> NetworkStats {
        let inner = self.inner();
        let mut stats = inner.stats.clone();
        stats.rtt_ms = inner.reliable_tx.srtt();
        stats.rtt_variance = inner.reliable_tx.rtt_var();
        stats.retransmissions = inner.reliable_tx.retransmissions();
        stats
    }

    pub fn unacked_count(&self) -> usize {
        self.inner().reliable_tx.unacked_count()
    }

    pub(crate) fn touch_received(&self, bytes: usize) {
        let mut inner = self.inner();
        inner.last_receive = Instant::now();
        inner.stats.packets_received += 1;
        inner.stats.bytes_received += bytes as u64;
    }

    pub(crate) fn touch_sent(&self, bytes: usize) {
        let mut inner = self.inner();
        inner.last_send = Instant::now();
        inner.stats.packets_sent += 1;
        inner.stats.bytes_sent += bytes as u64;
    }

    pub(crate) fn record_dropped(&self) {
        let mut inner = self.inner();
        inner.last_send = Instant::now();
        inner.stats.packets_dropped += 1;
    }

    pub(crate) fn next_connect_attempt(&self) -> u32 {
        let mut inner = self.inner();
        inner.connect_attempts += 1;
        inner.last_send = Instant::now();
        inner.connect_attempts
    }

    /// Wraps a message payload into a frame on the given channel, with acks piggybacked.
    pub(crate) fn prepare_frame(
        &self,
        channel: Channel,
        payload: &[u8],
    ) -> Result<Vec<u8>, WindowFull> {
        self.prepare(channel, FrameFlags::empty(), payload.to_vec())
    }

    pub(crate) fn prepare_assign(&self, id: ConnectionId) -> Result<Vec<u8>, WindowFull> {
        self.prepare(
            Channel::ReliableOrdered,
            FrameFlags::ASSIGN,
            id.0.to_le_bytes().to_vec(),
        )
    }

    fn prepare(
        &self,
        channel: Channel,
        flags: FrameFlags,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, WindowFull> {
        let mut inner = self.inner();
        let (ack, ack_bits) = inner.reliable_rx.ack_data();
        let header = match channel {
            Channel::ReliableOrdered => {
                let sequence = inner.reliable_tx.push(flags, payload.clone())?;
                FrameHeader::new(flags | FrameFlags::RELIABLE, sequence, ack, ack_bits)
            }
            Channel::Unreliable => {
                let sequence = inner.unreliable.next();
                FrameHeader::new(flags, sequence, ack, ack_bits)
            }
        };
        Ok(encode_frame(&header, &payload))
    }

    pub(crate) fn keepalive_frame(&self) -> Vec<u8> {
        let (ack, ack_bits) = self.inner().reliable_rx.ack_data();
        encode_frame(&FrameHeader::new(FrameFlags::empty(), 0, ack, ack_bits), &[])
    }

    pub(crate) fn receive_frame(&self, header: &FrameHeader, payload: &[u8]) -> Inbound {
        let mut inner = self.inner();
        inner.reliable_tx.process_ack(header.ack, header.ack_bits);

        if header.is_reliable() {
            let delivered = inner
                .reliable_rx
                .accept(header.sequence, header.flags, payload);
            return Inbound {
                delivered,
                needs_ack: true,
            };
        }

        if payload.is_empty() || !inner.unreliable.accept(header.sequence) {
            return Inbound::default();
        }

        Inbound {
            delivered: vec![(header.flags, payload.to_vec())],
            needs_ack: false,
        }
    }

    pub(crate) fn due_retransmissions(&self, now: Instant, min: Duration) -> Vec<Vec<u8>> {
        let mut inner = self.inner();
        let timeout = inner.reliable_tx.resend_timeout(min);
        let (ack, ack_bits) = inner.reliable_rx.ack_data();
        inner
            .reliable_tx
            .take_due(now, timeout)
            .into_iter()
            .map(|frame| {
                let header = FrameHeader::new(frame.flags, frame.sequence, ack, ack_bits);
                encode_frame(&header, &frame.payload)
            })
            .collect()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {:?})", self.endpoint, self.id(), self.state())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection table full ({0} connections)")]
pub struct TableFull(pub usize);

/// Remote peers keyed by address. Structural changes come from the receive loop only.
#[derive(Debug)]
pub struct ConnectionTable {
    by_addr: RwLock<HashMap<SocketAddr, Arc<Connection>>>,
    next_id: AtomicU32,
    max_connections: usize,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> Self {
        Self {
            by_addr: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            max_connections,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SocketAddr, Arc<Connection>>> {
        self.by_addr.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SocketAddr, Arc<Connection>>> {
        self.by_addr.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the connection and whether it was created by this call.
    pub fn get_or_create(
        &self,
        addr: SocketAddr,
        config: &TransportConfig,
    ) -> Result<(Arc<Connection>, bool), TableFull> {
        let mut table = self.write();
        if let Some(existing) = table.get(&addr) {
            return Ok((Arc::clone(existing), false));
        }

        if table.len() >= self.max_connections {
            return Err(TableFull(table.len()));
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let connection = Arc::new(Connection::new(
            id,
            Endpoint::Remote(addr),
            ConnectionState::Connected,
            config,
        ));
        table.insert(addr, Arc::clone(&connection));
        Ok((connection, true))
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        self.read().get(addr).cloned()
    }

    pub fn remove(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        let removed = self.write().remove(addr);
        if let Some(connection) = &removed {
            connection.set_state(ConnectionState::Disconnected);
        }
        removed
    }

    pub fn live(&self) -> Vec<Arc<Connection>> {
        self.read()
            .values()
            .filter(|c| c.is_live())
            .cloned()
            .collect()
    }

    pub fn cleanup_timed_out(&self, timeout: Duration) -> Vec<Arc<Connection>> {
        let timed_out: Vec<SocketAddr> = self
            .read()
            .iter()
            .filter(|(_, c)| c.is_timed_out(timeout))
            .map(|(&addr, _)| addr)
            .collect();

        timed_out
            .iter()
            .filter_map(|addr| self.remove(addr))
            .collect()
    }

    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let drained: Vec<_> = self.write().drain().map(|(_, c)| c).collect();
        for connection in &drained {
            connection.set_state(ConnectionState::Disconnected);
        }
        drained
    }

    pub fn connected_count(&self) -> usize {
        self.read().values().filter(|c| c.is_live()).count()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
