use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use glam::Vec3;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::event::{HandlerResult, SessionEvent, SubscriptionId, Subscribers};
use crate::message::{Message, MessageKind, MessageRegistry, RegistryError};
use crate::net::{
    Channel, Connection, DisconnectReason, Endpoint, Transport, TransportError, TransportHandler,
};
use crate::replication::{
    BehaviourTag, DynRpcTable, FieldAddress, FieldBinding, NetworkBehaviour, NetworkObject,
    PrefabFactory, PrefabRegistry, RpcContext, RpcError, RpcTarget, SpawnInfo, Value,
    decode_args, encode_args, erase, lock_behaviour,
};

use super::calls::CallsInFlight;
use super::config::SessionConfig;
use super::outbound::{Outbound, Outbox, Route, pump};
use super::player::Player;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Inactive,
    Server,
    Client,
    Host,
}

impl Mode {
    pub fn is_active(&self) -> bool {
        *self != Mode::Inactive
    }

    /// Server and host own the object table and allocate network ids.
    pub fn is_authority(&self) -> bool {
        matches!(self, Mode::Server | Mode::Host)
    }

    pub fn is_client(&self) -> bool {
        matches!(self, Mode::Client | Mode::Host)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is not active")]
    Inactive,
    #[error("session is already running as {0:?}")]
    AlreadyActive(Mode),
    #[error("only a server or host may do this")]
    NotAuthority,
    #[error("only a client or host may do this")]
    NotClient,
    #[error("unknown prefab '{0}'")]
    UnknownPrefab(String),
    #[error("player {0} is not part of this session")]
    UnknownPlayer(u32),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

type EventCallback = dyn Fn(&SessionEvent) -> HandlerResult + Send + Sync;

struct Run {
    transport: Arc<Transport>,
    outbox: Outbox,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

impl Run {
    async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.pump.await {
            log::warn!("Outbound pump ended abnormally: {}", e);
        }
        self.transport.stop().await;
    }
}

#[derive(Default)]
struct State {
    mode: Mode,
    /// Bumped on every start and stop; callbacks from older runs are ignored.
    generation: u64,
    run: Option<Run>,
    players: HashMap<Endpoint, Player>,
    local_player: Option<Player>,
    objects: BTreeMap<u32, Arc<NetworkObject>>,
    prefabs: PrefabRegistry,
}

impl State {
    fn outbox(&self) -> Result<Outbox, SessionError> {
        self.run
            .as_ref()
            .map(|run| run.outbox.clone())
            .ok_or(SessionError::Inactive)
    }

    fn require_authority(&self) -> Result<Outbox, SessionError> {
        match self.mode {
            Mode::Inactive => Err(SessionError::Inactive),
            mode if mode.is_authority() => self.outbox(),
            _ => Err(SessionError::NotAuthority),
        }
    }

    fn require_client(&self) -> Result<Outbox, SessionError> {
        match self.mode {
            Mode::Inactive => Err(SessionError::Inactive),
            mode if mode.is_client() => self.outbox(),
            _ => Err(SessionError::NotClient),
        }
    }
}

struct Inner {
    config: SessionConfig,
    registry: Arc<MessageRegistry>,
    factory: Arc<dyn PrefabFactory>,
    events: Subscribers<EventCallback>,
    rpc_tables: RwLock<HashMap<BehaviourTag, Arc<dyn DynRpcTable>>>,
    /// Never reset, so network ids are not reused for the handle's lifetime.
    next_network_id: AtomicU32,
    calls: CallsInFlight,
    state: Mutex<State>,
}

/// Cloneable handle coordinating transport, players and replicated objects.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn new(config: SessionConfig, factory: impl PrefabFactory) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Arc::new(MessageRegistry::with_defaults()),
                factory: Arc::new(factory),
                events: Subscribers::new(),
                rpc_tables: RwLock::new(HashMap::new()),
                next_network_id: AtomicU32::new(1),
                calls: CallsInFlight::default(),
                state: Mutex::new(State::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.inner.registry
    }

    pub fn mode(&self) -> Mode {
        self.state().mode
    }

    pub fn is_active(&self) -> bool {
        self.mode().is_active()
    }

    pub fn is_authority(&self) -> bool {
        self.mode().is_authority()
    }

    pub fn is_client(&self) -> bool {
        self.mode().is_client()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state()
            .run
            .as_ref()
            .map(|run| run.transport.local_addr())
    }

    pub fn players(&self) -> Vec<Player> {
        let mut players: Vec<Player> = self.state().players.values().cloned().collect();
        players.sort_by_key(Player::id);
        players
    }

    pub fn player(&self, id: u32) -> Option<Player> {
        self.state()
            .players
            .values()
            .find(|player| player.id() == id)
            .cloned()
    }

    pub fn local_player(&self) -> Option<Player> {
        self.state().local_player.clone()
    }

    pub fn object(&self, network_id: u32) -> Option<Arc<NetworkObject>> {
        self.state().objects.get(&network_id).cloned()
    }

    pub fn objects(&self) -> Vec<Arc<NetworkObject>> {
        self.state().objects.values().cloned().collect()
    }

    pub fn object_count(&self) -> usize {
        self.state().objects.len()
    }

    pub fn prefabs(&self) -> PrefabRegistry {
        self.state().prefabs.clone()
    }

    /// Must run in the same order on every peer before the prefab is spawned.
    pub fn register_prefab(&self, name: &str) -> u16 {
        self.state().prefabs.register(name)
    }

    /// Builds `B`'s remote-call table once; later calls are no-ops.
    pub fn register_behaviour<B: NetworkBehaviour>(&self) -> usize {
        let mut tables = self
            .inner
            .rpc_tables
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = tables.get(&B::TAG) {
            return existing.len();
        }

        let table = B::rpc_table();
        let count = table.len();
        tables.insert(B::TAG, erase(table));
        log::debug!("Registered behaviour '{}' with {} remote calls", B::TAG, count);
        count
    }

    fn rpc_table(&self, tag: BehaviourTag) -> Option<Arc<dyn DynRpcTable>> {
        self.inner
            .rpc_tables
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&tag)
            .cloned()
    }

    pub fn subscribe_events<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) -> HandlerResult + Send + Sync + 'static,
    {
        let callback: Arc<EventCallback> = Arc::new(callback);
        self.inner.events.subscribe(callback)
    }

    pub fn unsubscribe_events(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    pub fn subscribe<F>(&self, kind: MessageKind, callback: F) -> SubscriptionId
    where
        F: Fn(&Message, &Player) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.registry.subscribe(kind, callback)
    }

    fn emit(&self, event: SessionEvent) {
        self.inner.events.notify("session event", |callback| callback(&event));
    }

    /// Runs `f` on the first `B` behaviour of an object.
    pub fn with_behaviour<B: NetworkBehaviour, R>(
        &self,
        network_id: u32,
        f: impl FnOnce(&mut B) -> R,
    ) -> Option<R> {
        self.object(network_id)?.with_behaviour(f)
    }

    fn reserve(&self) -> Result<u64, SessionError> {
        let mut state = self.state();
        if state.mode.is_active() {
            return Err(SessionError::AlreadyActive(state.mode));
        }
        state.generation += 1;
        Ok(state.generation)
    }

    fn handler(&self, generation: u64, mode: Mode) -> Arc<dyn TransportHandler> {
        Arc::new(SessionHandler {
            session: Arc::downgrade(&self.inner),
            generation,
            mode,
        })
    }

    pub async fn start_server(&self, port: u16) -> Result<(), SessionError> {
        let generation = self.reserve()?;
        let cancel = CancellationToken::new();
        let transport = Transport::start_server(
            port,
            self.inner.config.transport.clone(),
            self.handler(generation, Mode::Server),
            cancel.child_token(),
        )
        .await?;
        self.install(generation, Mode::Server, transport, cancel).await?;
        Ok(())
    }

    pub async fn start_client(&self, server_addr: SocketAddr) -> Result<(), SessionError> {
        let generation = self.reserve()?;
        let cancel = CancellationToken::new();
        let transport = Transport::start_client(
            server_addr,
            self.inner.config.transport.clone(),
            self.handler(generation, Mode::Client),
            cancel.child_token(),
        )
        .await?;
        self.install(generation, Mode::Client, transport, cancel).await?;
        Ok(())
    }

    /// A server plus an embedded local player served in-process.
    pub async fn start_host(&self, port: u16) -> Result<(), SessionError> {
        let generation = self.reserve()?;
        let cancel = CancellationToken::new();
        let transport = Transport::start_server(
            port,
            self.inner.config.transport.clone(),
            self.handler(generation, Mode::Host),
            cancel.child_token(),
        )
        .await?;
        let transport = self.install(generation, Mode::Host, transport, cancel).await?;

        let loopback = match transport.attach_loopback() {
            Ok(loopback) => loopback,
            Err(e) => {
                self.stop().await;
                return Err(e.into());
            }
        };

        let player = Player::new(loopback, true);
        let inserted = {
            let mut state = self.state();
            // The loop may already have registered the loopback.
            if state.generation == generation && !state.players.contains_key(&player.endpoint()) {
                state.players.insert(player.endpoint(), player.clone());
                state.local_player = Some(player.clone());
                true
            } else {
                false
            }
        };
        if inserted {
            log::info!("Local {} joined", player);
            self.emit(SessionEvent::PlayerJoined(player));
        }
        Ok(())
    }

    async fn install(
        &self,
        generation: u64,
        mode: Mode,
        transport: Transport,
        cancel: CancellationToken,
    ) -> Result<Arc<Transport>, SessionError> {
        let transport = Arc::new(transport);
        let (outbox, rx) = Outbox::channel();
        let pump = tokio::spawn(pump(Arc::clone(&transport), rx, cancel.clone()));
        let run = Run {
            transport: Arc::clone(&transport),
            outbox,
            cancel,
            pump,
        };

        let rejected = {
            let mut state = self.state();
            if state.mode.is_active() || state.generation != generation {
                Some((run, state.mode))
            } else {
                state.mode = mode;
                state.run = Some(run);
                None
            }
        };
        if let Some((run, current)) = rejected {
            run.shutdown().await;
            return Err(SessionError::AlreadyActive(current));
        }

        log::info!("Session started as {:?} on {}", mode, transport.local_addr());
        Ok(transport)
    }

    /// Returns to Inactive, clearing players and objects. A no-op when inactive.
    pub async fn stop(&self) {
        let (run, objects, mode) = {
            let mut state = self.state();
            if !state.mode.is_active() {
                return;
            }
            let mode = std::mem::take(&mut state.mode);
            state.generation += 1;
            state.players.clear();
            state.local_player = None;
            let objects = std::mem::take(&mut state.objects);
            (state.run.take(), objects, mode)
        };

        if let Some(run) = run {
            run.shutdown().await;
        }
        for object in objects.into_values() {
            self.retire(object);
        }
        log::info!("Session stopped ({:?})", mode);
    }

    /// Server only: disconnect a remote player.
    pub async fn kick(&self, player: &Player) -> Result<(), SessionError> {
        let transport = {
            let state = self.state();
            state.require_authority()?;
            match &state.run {
                Some(run) => Arc::clone(&run.transport),
                None => return Err(SessionError::Inactive),
            }
        };
        transport.kick(player.connection()).await?;
        Ok(())
    }

    fn enqueue(
        &self,
        outbox: &Outbox,
        route: Route,
        bytes: Vec<u8>,
        channel: Channel,
    ) -> Result<(), SessionError> {
        if outbox.push(Outbound {
            route,
            bytes,
            channel,
        }) {
            Ok(())
        } else {
            Err(SessionError::Inactive)
        }
    }

    pub fn send_to_server(&self, message: &Message) -> Result<(), SessionError> {
        let outbox = self.state().require_client()?;
        let bytes = self.inner.registry.serialize(message)?;
        self.enqueue(&outbox, Route::Server, bytes, message.channel())
    }

    pub fn send_to(&self, player: &Player, message: &Message) -> Result<(), SessionError> {
        let outbox = self.state().require_authority()?;
        let bytes = self.inner.registry.serialize(message)?;
        self.enqueue(
            &outbox,
            Route::Player(Arc::clone(player.connection())),
            bytes,
            message.channel(),
        )
    }

    pub fn broadcast(&self, message: &Message, include_local: bool) -> Result<(), SessionError> {
        let outbox = self.state().require_authority()?;
        let bytes = self.inner.registry.serialize(message)?;
        self.enqueue(
            &outbox,
            Route::Broadcast { include_local },
            bytes,
            message.channel(),
        )
    }

    pub fn spawn(
        &self,
        prefab: &str,
        owner: &Player,
        position: Vec3,
    ) -> Result<Arc<NetworkObject>, SessionError> {
        let (prefab_id, outbox) = {
            let state = self.state();
            let outbox = state.require_authority()?;
            let prefab_id = state
                .prefabs
                .id_of(prefab)
                .ok_or_else(|| SessionError::UnknownPrefab(prefab.to_string()))?;
            if !state.players.values().any(|player| player == owner) {
                return Err(SessionError::UnknownPlayer(owner.id()));
            }
            (prefab_id, outbox)
        };

        let network_id = self.inner.next_network_id.fetch_add(1, Ordering::Relaxed);
        let message = Message::SpawnEntity {
            prefab_id,
            network_id,
            owner_id: owner.id(),
            position,
        };
        let bytes = self.inner.registry.serialize(&message)?;

        let info = SpawnInfo {
            network_id,
            prefab: prefab.to_string(),
            prefab_id,
            owner_id: owner.id(),
            owner: Some(owner.clone()),
            position,
            authority: true,
        };
        let object = Arc::new(NetworkObject::new(
            info.clone(),
            self.inner.factory.instantiate(&info),
        ));
        let route = Route::Broadcast {
            include_local: false,
        };
        self.bind_object(&object, route.clone(), &outbox);
        self.state()
            .objects
            .insert(network_id, Arc::clone(&object));

        self.enqueue(&outbox, route, bytes, message.channel())?;
        object.mark_spawned();
        log::info!("Spawned {} #{} for {} at {}", prefab, network_id, owner, position);
        Ok(object)
    }

    /// `Ok(false)` for an id that is not (or no longer) spawned.
    pub fn despawn(&self, network_id: u32) -> Result<bool, SessionError> {
        let message = Message::DespawnEntity { network_id };
        let bytes = self.inner.registry.serialize(&message)?;

        let (object, outbox) = {
            let mut state = self.state();
            let outbox = state.require_authority()?;
            match state.objects.remove(&network_id) {
                Some(object) => (object, outbox),
                None => return Ok(false),
            }
        };

        let route = Route::Broadcast {
            include_local: false,
        };
        if let Err(e) = self.enqueue(&outbox, route, bytes, message.channel()) {
            log::debug!("Despawn of #{} not broadcast: {}", network_id, e);
        }
        self.retire(object);
        log::info!("Despawned #{}", network_id);
        Ok(true)
    }

    /// Tears the object down now, or once the remote call running on it returns.
    fn retire(&self, object: Arc<NetworkObject>) {
        if let Some(object) = self.inner.calls.retire(object) {
            self.tear_down(&object);
        }
    }

    fn tear_down(&self, object: &NetworkObject) {
        object.mark_despawned();
        self.inner.factory.destroy(object);
    }

    fn bind_object(&self, object: &NetworkObject, route: Route, outbox: &Outbox) {
        let object_id = object.network_id();
        let owned = object.is_locally_owned();
        object.bind_fields(|behaviour_id, field_id| {
            FieldBinding::new(
                FieldAddress {
                    object_id,
                    behaviour_id,
                    field_id,
                },
                route.clone(),
                owned,
                Arc::clone(&self.inner.registry),
                outbox.clone(),
            )
        });
    }

    pub fn call_authority<B: NetworkBehaviour>(
        &self,
        object_id: u32,
        name: &str,
        args: &[Value],
    ) -> Result<(), RpcError> {
        let (bytes, outbox) = self.prepare_call::<B>(object_id, name, args, RpcTarget::Authority)?;
        self.enqueue(&outbox, Route::Server, bytes, Channel::ReliableOrdered)?;
        Ok(())
    }

    pub fn call_player<B: NetworkBehaviour>(
        &self,
        player: &Player,
        object_id: u32,
        name: &str,
        args: &[Value],
    ) -> Result<(), RpcError> {
        self.call_players::<B>(std::slice::from_ref(player), object_id, name, args)
    }

    pub fn call_players<B: NetworkBehaviour>(
        &self,
        players: &[Player],
        object_id: u32,
        name: &str,
        args: &[Value],
    ) -> Result<(), RpcError> {
        let (bytes, outbox) = self.prepare_call::<B>(object_id, name, args, RpcTarget::Clients)?;
        for player in players {
            self.enqueue(
                &outbox,
                Route::Player(Arc::clone(player.connection())),
                bytes.clone(),
                Channel::ReliableOrdered,
            )?;
        }
        Ok(())
    }

    /// Every client, the host's own player included.
    pub fn call_all<B: NetworkBehaviour>(
        &self,
        object_id: u32,
        name: &str,
        args: &[Value],
    ) -> Result<(), RpcError> {
        let (bytes, outbox) = self.prepare_call::<B>(object_id, name, args, RpcTarget::Clients)?;
        self.enqueue(
            &outbox,
            Route::Broadcast {
                include_local: true,
            },
            bytes,
            Channel::ReliableOrdered,
        )?;
        Ok(())
    }

    /// Validates a call against the table and the caller's role, then encodes it.
    fn prepare_call<B: NetworkBehaviour>(
        &self,
        object_id: u32,
        name: &str,
        args: &[Value],
        target: RpcTarget,
    ) -> Result<(Vec<u8>, Outbox), RpcError> {
        let table = self
            .rpc_table(B::TAG)
            .ok_or(RpcError::UnregisteredBehaviour(B::TAG))?;
        let (rpc_id, signature) = table.lookup(name).ok_or_else(|| RpcError::UnknownMethod {
            behaviour: B::TAG,
            name: name.to_string(),
        })?;
        if signature.target != target {
            return Err(RpcError::WrongTarget {
                name: signature.name,
                declared: signature.target,
                requested: target,
            });
        }
        signature.check(args)?;

        let (object, outbox) = {
            let state = self.state();
            if !state.mode.is_active() {
                return Err(SessionError::Inactive.into());
            }
            let allowed = match target {
                RpcTarget::Authority => state.mode.is_client(),
                RpcTarget::Clients => state.mode.is_authority(),
            };
            if !allowed {
                return Err(RpcError::WrongRole(target));
            }
            let object = state
                .objects
                .get(&object_id)
                .cloned()
                .ok_or(RpcError::UnknownObject(object_id))?;
            (object, state.outbox()?)
        };

        let behaviour_id = object
            .behaviour_id(B::TAG)
            .ok_or(RpcError::MissingBehaviour {
                object: object_id,
                behaviour: B::TAG,
            })?;
        let message = Message::RemoteCall {
            object_id,
            behaviour_id,
            rpc_id,
            data: encode_args(args)?,
        };
        let bytes = self
            .inner
            .registry
            .serialize(&message)
            .map_err(SessionError::from)?;
        Ok((bytes, outbox))
    }

    fn handle_connected(&self, generation: u64, mode: Mode, connection: &Arc<Connection>) {
        let local = connection.is_loopback() || mode == Mode::Client;
        let player = Player::new(Arc::clone(connection), local);

        let joined = {
            let mut state = self.state();
            if state.generation != generation || state.players.contains_key(&player.endpoint()) {
                None
            } else {
                state.players.insert(player.endpoint(), player.clone());
                if local {
                    state.local_player = Some(player.clone());
                }
                Some(player)
            }
        };

        if let Some(player) = joined {
            log::info!("{} joined", player);
            if mode == Mode::Client {
                self.emit(SessionEvent::Connected);
            }
            self.emit(SessionEvent::PlayerJoined(player));
        }
    }

    fn handle_disconnected(
        &self,
        generation: u64,
        mode: Mode,
        connection: &Arc<Connection>,
        reason: DisconnectReason,
    ) {
        let (player, orphaned) = {
            let mut state = self.state();
            if state.generation != generation {
                return;
            }
            let Some(player) = state.players.remove(&connection.endpoint()) else {
                return;
            };
            if state.local_player.as_ref() == Some(&player) {
                state.local_player = None;
            }
            let orphaned: Vec<u32> = if mode.is_authority() && self.inner.config.despawn_on_leave {
                state
                    .objects
                    .values()
                    .filter(|object| object.owner() == Some(&player))
                    .map(|object| object.network_id())
                    .collect()
            } else {
                Vec::new()
            };
            (player, orphaned)
        };

        log::info!("{} left ({})", player, reason.as_str());
        if mode == Mode::Client {
            self.emit(SessionEvent::Disconnected(reason));
        }
        self.emit(SessionEvent::PlayerLeft { player, reason });

        for network_id in orphaned {
            if let Err(e) = self.despawn(network_id) {
                log::warn!("Failed to despawn orphaned #{}: {}", network_id, e);
            }
        }
    }

    fn handle_data(&self, generation: u64, mode: Mode, connection: &Arc<Connection>, data: &[u8]) {
        let message = match self.inner.registry.deserialize(data) {
            Ok(Some(message)) => message,
            Ok(None) => {
                log::debug!("Ignoring message with unregistered code from {}", connection);
                return;
            }
            Err(e) => {
                log::debug!("Dropping message from {}: {}", connection, e);
                return;
            }
        };

        let sender = {
            let state = self.state();
            if state.generation != generation {
                return;
            }
            state.players.get(&connection.endpoint()).cloned()
        };
        let Some(sender) = sender else {
            log::debug!("Dropping {} from unknown sender {}", message.kind().as_str(), connection);
            return;
        };

        self.replicate(mode, &message, &sender);
        self.inner.registry.dispatch(&message, &sender);
    }

    fn replicate(&self, mode: Mode, message: &Message, sender: &Player) {
        match message {
            Message::SpawnEntity {
                prefab_id,
                network_id,
                owner_id,
                position,
            } => {
                if mode.is_authority() {
                    log::debug!("Ignoring spawn #{} sent to the authority", network_id);
                } else {
                    self.apply_spawn(*prefab_id, *network_id, *owner_id, *position);
                }
            }
            Message::DespawnEntity { network_id } => {
                if mode.is_authority() {
                    log::debug!("Ignoring despawn #{} sent to the authority", network_id);
                } else {
                    self.apply_despawn(*network_id);
                }
            }
            Message::FieldUpdate {
                object_id,
                behaviour_id,
                field_id,
                data,
            } => self.apply_field_update(
                mode,
                sender,
                message,
                FieldAddress {
                    object_id: *object_id,
                    behaviour_id: *behaviour_id,
                    field_id: *field_id,
                },
                data,
            ),
            Message::RemoteCall {
                object_id,
                behaviour_id,
                rpc_id,
                data,
            } => self.apply_remote_call(mode, sender, *object_id, *behaviour_id, *rpc_id, data),
            Message::ChatText { .. } => {}
        }
    }

    fn apply_spawn(&self, prefab_id: u16, network_id: u32, owner_id: u32, position: Vec3) {
        let (prefab, owner, outbox) = {
            let state = self.state();
            if state.objects.contains_key(&network_id) {
                log::debug!("Duplicate spawn #{} dropped", network_id);
                return;
            }
            let Some(prefab) = state.prefabs.name_of(prefab_id).map(str::to_string) else {
                log::warn!("Spawn #{} names unknown prefab id {}", network_id, prefab_id);
                return;
            };
            let owner = state
                .players
                .values()
                .find(|player| player.id() == owner_id)
                .cloned();
            let Ok(outbox) = state.outbox() else {
                return;
            };
            (prefab, owner, outbox)
        };

        if owner.is_none() {
            log::warn!("Spawn #{} is owned by peer {}, not known here", network_id, owner_id);
        }

        let info = SpawnInfo {
            network_id,
            prefab,
            prefab_id,
            owner_id,
            owner,
            position,
            authority: false,
        };
        let object = Arc::new(NetworkObject::new(
            info.clone(),
            self.inner.factory.instantiate(&info),
        ));
        self.bind_object(&object, Route::Server, &outbox);

        {
            let mut state = self.state();
            if state.objects.contains_key(&network_id) {
                return;
            }
            state.objects.insert(network_id, Arc::clone(&object));
        }
        object.mark_spawned();
        log::debug!("Replicated spawn of {} #{} at {}", info.prefab, network_id, position);
    }

    fn apply_despawn(&self, network_id: u32) {
        let Some(object) = self.state().objects.remove(&network_id) else {
            return;
        };
        self.retire(object);
        log::debug!("Replicated despawn of #{}", network_id);
    }

    fn apply_field_update(
        &self,
        mode: Mode,
        sender: &Player,
        message: &Message,
        address: FieldAddress,
        data: &[u8],
    ) {
        let Some(object) = self.object(address.object_id) else {
            log::debug!("Field update for unknown object #{}", address.object_id);
            return;
        };
        if mode.is_authority() && object.owner() != Some(sender) {
            log::warn!(
                "Rejecting field update for #{} from non-owner {}",
                address.object_id,
                sender
            );
            return;
        }
        let Some((_, behaviour)) = object.behaviour(address.behaviour_id) else {
            log::warn!("Field update for missing behaviour {:?}", address);
            return;
        };

        {
            let mut behaviour = lock_behaviour(&behaviour);
            let mut fields = behaviour.fields_mut();
            let Some(field) = fields.get_mut(address.field_id as usize) else {
                log::warn!("Field update for missing field {:?}", address);
                return;
            };
            if let Err(e) = field.apply(data) {
                log::warn!("Field update for {:?} undecodable: {}", address, e);
                return;
            }
        }

        if mode.is_authority() && !sender.is_local() {
            self.relay(message, sender);
        }
    }

    /// Forwards a client's accepted write to every other remote peer.
    fn relay(&self, message: &Message, sender: &Player) {
        let Ok(outbox) = self.state().outbox() else {
            return;
        };
        let result = self
            .inner
            .registry
            .serialize(message)
            .map_err(SessionError::from)
            .and_then(|bytes| {
                self.enqueue(
                    &outbox,
                    Route::BroadcastExcept(sender.connection().id()),
                    bytes,
                    message.channel(),
                )
            });
        if let Err(e) = result {
            log::warn!("Relay from {} failed: {}", sender, e);
        }
    }

    fn apply_remote_call(
        &self,
        mode: Mode,
        sender: &Player,
        object_id: u32,
        behaviour_id: u16,
        rpc_id: u16,
        data: &[u8],
    ) {
        let Some(object) = self.object(object_id) else {
            log::debug!("Remote call for unknown object #{}", object_id);
            return;
        };
        let Some((tag, behaviour)) = object.behaviour(behaviour_id) else {
            log::warn!("Remote call for missing behaviour {} on #{}", behaviour_id, object_id);
            return;
        };
        let Some(table) = self.rpc_table(tag) else {
            log::warn!("Remote call on '{}', which has no registered rpc table", tag);
            return;
        };
        let Some(signature) = table.signature(rpc_id) else {
            log::warn!("Remote call id {} does not exist on '{}'", rpc_id, tag);
            return;
        };

        let allowed = match signature.target {
            RpcTarget::Authority => mode.is_authority(),
            RpcTarget::Clients => mode.is_client() && sender.is_local(),
        };
        if !allowed {
            log::warn!(
                "Dropping {:?} call '{}' from {} as {:?}",
                signature.target,
                signature.name,
                sender,
                mode
            );
            return;
        }

        let args = match decode_args(data, &signature.params) {
            Ok(args) => args,
            Err(e) => {
                log::warn!("Remote call '{}' undecodable: {}", signature.name, e);
                return;
            }
        };

        let ctx = RpcContext {
            session: self.clone(),
            sender: sender.clone(),
            object_id,
            behaviour_id,
        };
        self.inner.calls.enter(object_id);
        let result = {
            let mut behaviour = lock_behaviour(&behaviour);
            table.invoke(rpc_id, &mut **behaviour, &ctx, &args)
        };
        if let Some(retired) = self.inner.calls.leave(object_id) {
            self.tear_down(&retired);
        }
        if let Err(e) = result {
            log::warn!("Remote call '{}' on #{} failed: {}", signature.name, object_id, e);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Session")
            .field("mode", &state.mode)
            .field("players", &state.players.len())
            .field("objects", &state.objects.len())
            .finish()
    }
}

struct SessionHandler {
    session: Weak<Inner>,
    generation: u64,
    mode: Mode,
}

impl SessionHandler {
    fn session(&self) -> Option<Session> {
        self.session.upgrade().map(|inner| Session { inner })
    }
}

impl TransportHandler for SessionHandler {
    fn on_connected(&self, connection: &Arc<Connection>) {
        if let Some(session) = self.session() {
            session.handle_connected(self.generation, self.mode, connection);
        }
    }

    fn on_disconnected(&self, connection: &Arc<Connection>, reason: DisconnectReason) {
        if let Some(session) = self.session() {
            session.handle_disconnected(self.generation, self.mode, connection, reason);
        }
    }

    fn on_data(&self, connection: &Arc<Connection>, data: &[u8]) {
        if let Some(session) = self.session() {
            session.handle_data(self.generation, self.mode, connection, data);
        }
    }

    fn on_error(&self, error: &TransportError) {
        log::warn!("Transport error: {}", error);
        if let Some(session) = self.session() {
            if session.state().generation == self.generation {
                session.emit(SessionEvent::Error(error.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::EmptyFactory;

    #[test]
    fn test_mode_roles() {
        assert!(!Mode::Inactive.is_active());
        assert!(Mode::Server.is_authority() && !Mode::Server.is_client());
        assert!(Mode::Client.is_client() && !Mode::Client.is_authority());
        assert!(Mode::Host.is_authority() && Mode::Host.is_client());
    }

    #[test]
    fn test_inactive_session_rejects_work() {
        let session = Session::new(SessionConfig::default(), EmptyFactory);
        session.register_prefab("PlayerPrefab");

        assert_eq!(session.mode(), Mode::Inactive);
        assert!(matches!(session.despawn(1), Err(SessionError::Inactive)));
        assert!(matches!(
            session.broadcast(&Message::chat("hi"), true),
            Err(SessionError::Inactive)
        ));
        assert_eq!(session.prefabs().id_of("PlayerPrefab"), Some(1));
        assert!(session.players().is_empty());
        assert!(session.local_addr().is_none());
    }
}
