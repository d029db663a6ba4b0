pub mod codec;
pub mod event;
pub mod message;
pub mod net;
pub mod replication;
pub mod session;

pub use codec::{CodecError, PacketReader, PacketWriter};
pub use event::{HandlerError, HandlerResult, SessionEvent, SubscriptionId};
pub use message::{Message, MessageKind, MessageRegistry, RegistryError};
pub use net::{
    Channel, Connection, ConnectionId, DEFAULT_PORT, DisconnectReason, MAX_PACKET_SIZE,
    NetworkStats, PacketLossSimulation, Transport, TransportConfig, TransportError,
    TransportHandler,
};
pub use replication::{
    Behaviour, BehaviourTag, EmptyFactory, Field, FieldValue, NetworkBehaviour, NetworkObject,
    PrefabFactory, RpcArgs, RpcContext, RpcError, RpcTable, RpcTarget, SpawnInfo, SyncField,
    Value, ValueKind,
};
pub use session::{Mode, Player, Session, SessionConfig, SessionError};
