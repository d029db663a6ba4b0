use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures::future::join_all;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::config::TransportConfig;
use super::connection::{
    Connection, ConnectionId, ConnectionState, ConnectionTable, Endpoint, TableFull,
};
use super::frame::{
    Channel, Datagram, FRAME_HEADER_SIZE, FrameFlags, MAX_PACKET_SIZE, Sentinel, classify,
};
use super::reliability::WindowFull;

const RECV_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Kicked,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Kicked => "kicked",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("transport is not running")]
    NotRunning,
    #[error("this operation requires a server transport")]
    NotServer,
    #[error("payload of {size} bytes exceeds the {max} byte datagram limit")]
    TooLarge { size: usize, max: usize },
    #[error(transparent)]
    WindowFull(#[from] WindowFull),
    #[error(transparent)]
    TableFull(#[from] TableFull),
    #[error("{0} is not connected")]
    NotConnected(ConnectionId),
    #[error("no answer from {0} after {1} connect attempts")]
    ConnectTimeout(SocketAddr, u32),
    #[error("connection refused by {0}")]
    Rejected(SocketAddr),
    #[error("broadcast failed for {failed} of {total} connections")]
    Broadcast {
        failed: usize,
        total: usize,
        errors: Vec<TransportError>,
    },
}

/// Callbacks run on the receive loop, one at a time, in arrival order.
pub trait TransportHandler: Send + Sync + 'static {
    fn on_connected(&self, connection: &Arc<Connection>);
    fn on_disconnected(&self, connection: &Arc<Connection>, reason: DisconnectReason);
    fn on_data(&self, connection: &Arc<Connection>, data: &[u8]);
    fn on_error(&self, error: &TransportError);
}

#[derive(Debug)]
enum LoopbackEvent {
    Connected,
    Data(Vec<u8>),
}

struct Shared {
    role: Role,
    socket: UdpSocket,
    local_addr: SocketAddr,
    config: TransportConfig,
    connections: ConnectionTable,
    server: Option<Arc<Connection>>,
    loopback: Mutex<Option<Arc<Connection>>>,
    loopback_tx: mpsc::UnboundedSender<LoopbackEvent>,
    handler: Arc<dyn TransportHandler>,
    cancel: CancellationToken,
}

pub struct Transport {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Cancelling `cancel` stops the receive loop, as does `stop`.
    pub async fn start_server(
        port: u16,
        config: TransportConfig,
        handler: Arc<dyn TransportHandler>,
        cancel: CancellationToken,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)).await?;
        let transport = Self::spawn(Role::Server, socket, None, config, handler, cancel)?;
        log::info!("Server transport listening on {}", transport.local_addr());
        Ok(transport)
    }

    pub async fn start_client(
        server_addr: SocketAddr,
        config: TransportConfig,
        handler: Arc<dyn TransportHandler>,
        cancel: CancellationToken,
    ) -> Result<Self, TransportError> {
        let unspecified = match server_addr {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?;
        let server = Arc::new(Connection::new(
            ConnectionId::UNASSIGNED,
            Endpoint::Remote(server_addr),
            ConnectionState::Connecting,
            &config,
        ));

        let transport = Self::spawn(
            Role::Client,
            socket,
            Some(Arc::clone(&server)),
            config,
            handler,
            cancel,
        )?;
        log::info!("Connecting to {}", server_addr);
        server.next_connect_attempt();
        transport
            .shared
            .send_control(server_addr, Sentinel::Connect)
            .await?;
        Ok(transport)
    }

    fn spawn(
        role: Role,
        socket: UdpSocket,
        server: Option<Arc<Connection>>,
        config: TransportConfig,
        handler: Arc<dyn TransportHandler>,
        cancel: CancellationToken,
    ) -> Result<Self, TransportError> {
        let local_addr = socket.local_addr()?;
        let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            role,
            socket,
            local_addr,
            connections: ConnectionTable::new(config.max_connections),
            config,
            server,
            loopback: Mutex::new(None),
            loopback_tx,
            handler,
            cancel,
        });

        let task = tokio::spawn(receive_loop(Arc::clone(&shared), loopback_rx));
        Ok(Self {
            shared,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        !self.shared.cancel.is_cancelled()
    }

    /// On a client, the connection to the server.
    pub fn server_connection(&self) -> Option<Arc<Connection>> {
        self.shared.server.clone()
    }

    pub fn loopback(&self) -> Option<Arc<Connection>> {
        self.shared.loopback_slot().clone()
    }

    /// Every live peer, plus the loopback when one is attached.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut peers = self.shared.peers();
        peers.extend(self.loopback());
        peers
    }

    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    /// Registers the host's own client. It is served in-process with id 0
    /// and never touches the socket.
    pub fn attach_loopback(&self) -> Result<Arc<Connection>, TransportError> {
        if self.shared.role != Role::Server {
            return Err(TransportError::NotServer);
        }
        if !self.is_running() {
            return Err(TransportError::NotRunning);
        }

        let mut slot = self.shared.loopback_slot();
        if let Some(existing) = slot.as_ref() {
            return Ok(Arc::clone(existing));
        }

        let connection = Arc::new(Connection::new(
            ConnectionId::LOOPBACK,
            Endpoint::Loopback,
            ConnectionState::Connected,
            &self.shared.config,
        ));
        *slot = Some(Arc::clone(&connection));
        drop(slot);

        self.shared
            .loopback_tx
            .send(LoopbackEvent::Connected)
            .map_err(|_| TransportError::NotRunning)?;
        Ok(connection)
    }

    pub async fn send_to(
        &self,
        connection: &Arc<Connection>,
        data: &[u8],
        channel: Channel,
    ) -> Result<(), TransportError> {
        if !self.is_running() {
            return Err(TransportError::NotRunning);
        }
        self.shared.send_message(connection, data, channel).await
    }

    pub async fn broadcast(
        &self,
        data: &[u8],
        channel: Channel,
        include_local: bool,
    ) -> Result<(), TransportError> {
        self.broadcast_filtered(data, channel, include_local, None)
            .await
    }

    /// Broadcast to every remote peer except `excluded`; the loopback is skipped.
    pub async fn broadcast_except(
        &self,
        data: &[u8],
        channel: Channel,
        excluded: ConnectionId,
    ) -> Result<(), TransportError> {
        self.broadcast_filtered(data, channel, false, Some(excluded))
            .await
    }

    async fn broadcast_filtered(
        &self,
        data: &[u8],
        channel: Channel,
        include_local: bool,
        excluded: Option<ConnectionId>,
    ) -> Result<(), TransportError> {
        if !self.is_running() {
            return Err(TransportError::NotRunning);
        }

        let mut targets = self.shared.peers();
        if include_local {
            targets.extend(self.loopback());
        }
        if let Some(excluded) = excluded {
            targets.retain(|c| c.id() != excluded);
        }

        let total = targets.len();
        let results = join_all(
            targets
                .iter()
                .map(|connection| self.shared.send_message(connection, data, channel)),
        )
        .await;

        let errors: Vec<TransportError> = results.into_iter().filter_map(Result::err).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Broadcast {
                failed: errors.len(),
                total,
                errors,
            })
        }
    }

    /// Server only: drop a peer and tell it so.
    pub async fn kick(&self, connection: &Arc<Connection>) -> Result<(), TransportError> {
        if self.shared.role != Role::Server {
            return Err(TransportError::NotServer);
        }
        let Some(addr) = connection.addr() else {
            return Ok(());
        };
        if self.shared.connections.remove(&addr).is_some() {
            self.shared.send_control(addr, Sentinel::Disconnect).await?;
            log::info!("Kicked {}", connection);
            self.shared
                .handler
                .on_disconnected(connection, DisconnectReason::Kicked);
        }
        Ok(())
    }

    /// Stops the receive loop, then says goodbye to every live peer.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();

        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("Receive loop ended abnormally: {}", e);
            }
        }

        for connection in self.shared.peers() {
            if let Some(addr) = connection.addr() {
                if let Err(e) = self.shared.send_control(addr, Sentinel::Disconnect).await {
                    log::debug!("Failed to notify {} of shutdown: {}", addr, e);
                }
            }
        }

        self.shared.connections.drain();
        if let Some(server) = &self.shared.server {
            server.set_state(ConnectionState::Disconnected);
        }
        if let Some(loopback) = self.shared.loopback_slot().take() {
            loopback.set_state(ConnectionState::Disconnected);
        }
        log::info!("Transport on {} stopped", self.shared.local_addr);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn receive_loop(shared: Arc<Shared>, mut loopback_rx: mpsc::UnboundedReceiver<LoopbackEvent>) {
    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
    let mut tick = tokio::time::interval(shared.config.tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            received = shared.socket.recv_from(&mut buffer) => match received {
                Ok((len, from)) => shared.handle_datagram(&buffer[..len], from).await,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    log::debug!("Ignoring connection reset on {}", shared.local_addr);
                }
                Err(e) if is_transient(&e) => {
                    log::warn!("Receive failed on {}: {}", shared.local_addr, e);
                    shared.handler.on_error(&TransportError::Io(e));
                }
                Err(e) => {
                    log::error!("Socket on {} is unusable: {}", shared.local_addr, e);
                    shared.handler.on_error(&TransportError::Io(e));
                    shared.cancel.cancel();
                    break;
                }
            },
            Some(event) = loopback_rx.recv() => shared.handle_loopback(event),
            _ = tick.tick() => shared.maintain().await,
        }
    }
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::InvalidData
    )
}

impl Shared {
    fn loopback_slot(&self) -> MutexGuard<'_, Option<Arc<Connection>>> {
        lock(&self.loopback)
    }

    fn peers(&self) -> Vec<Arc<Connection>> {
        match self.role {
            Role::Server => self.connections.live(),
            Role::Client => self
                .server
                .iter()
                .filter(|c| c.is_live())
                .cloned()
                .collect(),
        }
    }

    fn is_own_address(&self, from: SocketAddr) -> bool {
        if from.port() != self.local_addr.port() {
            return false;
        }
        from.ip() == self.local_addr.ip()
            || (self.local_addr.ip().is_unspecified() && from.ip().is_loopback())
    }

    async fn send_control(&self, addr: SocketAddr, sentinel: Sentinel) -> io::Result<()> {
        self.socket.send_to(&sentinel.as_datagram(), addr).await?;
        Ok(())
    }

    async fn send_frame(&self, connection: &Connection, frame: &[u8]) -> io::Result<()> {
        let Some(addr) = connection.addr() else {
            return Ok(());
        };
        if self.config.packet_loss.should_drop() {
            connection.record_dropped();
            return Ok(());
        }
        let sent = self.socket.send_to(frame, addr).await?;
        connection.touch_sent(sent);
        Ok(())
    }

    async fn send_message(
        &self,
        connection: &Arc<Connection>,
        data: &[u8],
        channel: Channel,
    ) -> Result<(), TransportError> {
        if data.len() + FRAME_HEADER_SIZE > MAX_PACKET_SIZE {
            return Err(TransportError::TooLarge {
                size: data.len(),
                max: MAX_PACKET_SIZE - FRAME_HEADER_SIZE,
            });
        }
        if !connection.is_live() {
            return Err(TransportError::NotConnected(connection.id()));
        }

        if connection.is_loopback() {
            return self
                .loopback_tx
                .send(LoopbackEvent::Data(data.to_vec()))
                .map_err(|_| TransportError::NotRunning);
        }

        let frame = connection.prepare_frame(channel, data)?;
        self.send_frame(connection, &frame).await?;
        Ok(())
    }

    fn handle_loopback(&self, event: LoopbackEvent) {
        let Some(loopback) = self.loopback_slot().clone() else {
            return;
        };
        match event {
            LoopbackEvent::Connected => {
                log::info!("Local client attached");
                self.handler.on_connected(&loopback);
            }
            LoopbackEvent::Data(data) => self.handler.on_data(&loopback, &data),
        }
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        if self.is_own_address(from) {
            return;
        }
        if data.len() > MAX_PACKET_SIZE {
            log::debug!("Dropping oversized datagram ({} bytes) from {}", data.len(), from);
            return;
        }

        match classify(data) {
            Datagram::Control(sentinel) => self.handle_control(sentinel, from).await,
            Datagram::Frame(header, payload) => {
                let Some(connection) = self.peer_for(from) else {
                    log::debug!("Frame from unknown peer {}", from);
                    return;
                };
                if self.role == Role::Client
                    && connection.state() == ConnectionState::Connecting
                {
                    // A frame from the server means the welcome was lost in flight.
                    self.promote_server(&connection);
                }
                if !connection.is_live() {
                    return;
                }

                connection.touch_received(data.len());
                let inbound = connection.receive_frame(&header, payload);
                if inbound.needs_ack {
                    let ack = connection.keepalive_frame();
                    if let Err(e) = self.send_frame(&connection, &ack).await {
                        log::debug!("Failed to ack {}: {}", from, e);
                    }
                }

                for (flags, payload) in inbound.delivered {
                    if flags.contains(FrameFlags::ASSIGN) {
                        self.handle_assign(&connection, &payload);
                    } else if self.role == Role::Server
                        || connection.id() != ConnectionId::UNASSIGNED
                    {
                        self.handler.on_data(&connection, &payload);
                    } else {
                        log::debug!("Dropping data from {} ahead of its id assignment", from);
                    }
                }
            }
            Datagram::Malformed => {
                log::debug!("Malformed datagram ({} bytes) from {}", data.len(), from);
            }
        }
    }

    fn peer_for(&self, from: SocketAddr) -> Option<Arc<Connection>> {
        match self.role {
            Role::Server => self.connections.get(&from),
            Role::Client => self
                .server
                .as_ref()
                .filter(|s| s.addr() == Some(from))
                .cloned(),
        }
    }

    /// The client only counts as connected once it knows its own id.
    fn handle_assign(&self, connection: &Arc<Connection>, payload: &[u8]) {
        if self.role != Role::Client {
            return;
        }
        let Ok(bytes) = <[u8; 4]>::try_from(payload) else {
            log::warn!("Malformed id assignment ({} bytes)", payload.len());
            return;
        };

        let id = ConnectionId(u32::from_le_bytes(bytes));
        let first = connection.id() == ConnectionId::UNASSIGNED;
        connection.assign_id(id);
        if first {
            log::info!("Connected to {} as {}", connection.endpoint(), id);
            self.handler.on_connected(connection);
        } else {
            log::debug!("Server reassigned {}", id);
        }
    }

    fn promote_server(&self, server: &Connection) {
        server.set_state(ConnectionState::Connected);
        server.touch_received(0);
        log::debug!("Welcomed by {}", server.endpoint());
    }

    async fn handle_control(&self, sentinel: Sentinel, from: SocketAddr) {
        match (self.role, sentinel) {
            (Role::Server, Sentinel::Connect) => self.accept_connect(from).await,
            (Role::Server, Sentinel::Disconnect) => {
                if let Some(connection) = self.connections.remove(&from) {
                    log::info!("{} disconnected", from);
                    self.handler
                        .on_disconnected(&connection, DisconnectReason::Graceful);
                }
            }
            (Role::Client, Sentinel::Welcome) => {
                if let Some(server) = self.peer_for(from) {
                    if server.state() == ConnectionState::Connecting {
                        self.promote_server(&server);
                    }
                }
            }
            (Role::Client, Sentinel::Disconnect) => {
                let Some(server) = self.peer_for(from) else {
                    return;
                };
                let announced = server.id() != ConnectionId::UNASSIGNED;
                match server.state() {
                    ConnectionState::Disconnected => {}
                    ConnectionState::Connected if announced => {
                        log::info!("Disconnected by server");
                        server.set_state(ConnectionState::Disconnected);
                        self.handler
                            .on_disconnected(&server, DisconnectReason::Graceful);
                        self.cancel.cancel();
                    }
                    _ => {
                        log::warn!("Connection denied by {}", from);
                        server.set_state(ConnectionState::Disconnected);
                        self.handler.on_error(&TransportError::Rejected(from));
                        self.cancel.cancel();
                    }
                }
            }
            (role, sentinel) => {
                log::debug!("Ignoring {:?} from {} as {:?}", sentinel, from, role);
            }
        }
    }

    async fn accept_connect(&self, from: SocketAddr) {
        let created = match self.connections.get_or_create(from, &self.config) {
            Ok((connection, created)) => created.then_some(connection),
            Err(full) => {
                log::warn!("Rejecting {}: {}", from, full);
                if let Err(e) = self.send_control(from, Sentinel::Disconnect).await {
                    log::debug!("Failed to reject {}: {}", from, e);
                }
                return;
            }
        };

        if let Err(e) = self.send_control(from, Sentinel::Welcome).await {
            log::warn!("Failed to welcome {}: {}", from, e);
        }

        // Repeated connects only get the welcome again.
        let Some(connection) = created else {
            return;
        };

        connection.touch_received(1);
        log::info!("Client {} connected from {}", connection.id(), from);
        match connection.prepare_assign(connection.id()) {
            Ok(frame) => {
                if let Err(e) = self.send_frame(&connection, &frame).await {
                    log::debug!("Failed to send id to {}: {}", from, e);
                }
            }
            Err(e) => log::warn!("Failed to queue id for {}: {}", from, e),
        }
        self.handler.on_connected(&connection);
    }

    async fn maintain(&self) {
        let now = Instant::now();
        match self.role {
            Role::Server => {
                for connection in self.connections.live() {
                    self.service(&connection, now).await;
                }
                for connection in self.connections.cleanup_timed_out(self.config.peer_timeout()) {
                    log::info!("Client {} timed out", connection.id());
                    self.handler
                        .on_disconnected(&connection, DisconnectReason::Timeout);
                }
            }
            Role::Client => {
                let Some(server) = self.server.clone() else {
                    return;
                };
                match server.state() {
                    ConnectionState::Connecting => self.retry_connect(&server, now).await,
                    ConnectionState::Connected => {
                        self.service(&server, now).await;
                        if server.is_timed_out(self.config.peer_timeout()) {
                            log::warn!("Server connection lost");
                            server.set_state(ConnectionState::Disconnected);
                            if server.id() == ConnectionId::UNASSIGNED {
                                self.handler.on_error(&TransportError::ConnectTimeout(
                                    server.addr().unwrap_or(self.local_addr),
                                    self.config.connect_attempts,
                                ));
                            } else {
                                self.handler
                                    .on_disconnected(&server, DisconnectReason::Timeout);
                            }
                            self.cancel.cancel();
                        }
                    }
                    ConnectionState::Disconnected => {}
                }
            }
        }
    }

    async fn retry_connect(&self, server: &Arc<Connection>, now: Instant) {
        if now.duration_since(server.last_send()) < self.config.connect_retry_interval {
            return;
        }
        let Some(addr) = server.addr() else {
            return;
        };

        let attempt = server.next_connect_attempt();
        if attempt > self.config.connect_attempts {
            log::warn!("Connection timeout");
            server.set_state(ConnectionState::Disconnected);
            self.handler.on_error(&TransportError::ConnectTimeout(
                addr,
                self.config.connect_attempts,
            ));
            self.cancel.cancel();
            return;
        }

        log::debug!("Connect attempt {} to {}", attempt, addr);
        if let Err(e) = self.send_control(addr, Sentinel::Connect).await {
            log::debug!("Connect attempt to {} failed: {}", addr, e);
        }
    }

    async fn service(&self, connection: &Connection, now: Instant) {
        for frame in connection.due_retransmissions(now, self.config.resend_min) {
            if let Err(e) = self.send_frame(connection, &frame).await {
                log::debug!("Retransmit to {} failed: {}", connection, e);
            }
        }

        if now.duration_since(connection.last_send()) >= self.config.heartbeat_interval {
            let keepalive = connection.keepalive_frame();
            if let Err(e) = self.send_frame(connection, &keepalive).await {
                log::debug!("Keepalive to {} failed: {}", connection, e);
            }
        }
    }
}
