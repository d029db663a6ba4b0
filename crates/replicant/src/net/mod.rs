mod config;
mod connection;
mod frame;
mod reliability;
mod stats;
mod transport;

pub use config::TransportConfig;
pub use connection::{
    Connection, ConnectionId, ConnectionState, ConnectionTable, Endpoint, TableFull,
};
pub use frame::{
    Channel, DEFAULT_PORT, Datagram, FRAME_HEADER_SIZE, FrameFlags, FrameHeader, MAX_PACKET_SIZE,
    Sentinel, classify, decode_frame, encode_frame, sequence_greater_than,
};
pub use reliability::{PendingFrame, ReliableReceiver, ReliableSender, UnreliableSequencer, WindowFull};
pub use stats::{NetworkStats, PacketLossSimulation};
pub use transport::{DisconnectReason, Role, Transport, TransportError, TransportHandler};
