use glam::Vec3;

use crate::codec::{CodecError, PacketReader, PacketWriter};
use crate::net::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ChatText,
    SpawnEntity,
    DespawnEntity,
    FieldUpdate,
    RemoteCall,
}

impl MessageKind {
    /// Canonical registration order.
    pub const ALL: [MessageKind; 5] = [
        MessageKind::ChatText,
        MessageKind::SpawnEntity,
        MessageKind::DespawnEntity,
        MessageKind::FieldUpdate,
        MessageKind::RemoteCall,
    ];

    pub fn channel(&self) -> Channel {
        match self {
            Self::ChatText => Channel::Unreliable,
            Self::SpawnEntity => Channel::ReliableOrdered,
            Self::DespawnEntity => Channel::ReliableOrdered,
            Self::FieldUpdate => Channel::ReliableOrdered,
            Self::RemoteCall => Channel::ReliableOrdered,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatText => "ChatText",
            Self::SpawnEntity => "SpawnEntity",
            Self::DespawnEntity => "DespawnEntity",
            Self::FieldUpdate => "FieldUpdate",
            Self::RemoteCall => "RemoteCall",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ChatText {
        text: String,
    },
    SpawnEntity {
        prefab_id: u16,
        network_id: u32,
        owner_id: u32,
        position: Vec3,
    },
    DespawnEntity {
        network_id: u32,
    },
    FieldUpdate {
        object_id: u32,
        behaviour_id: u16,
        field_id: u16,
        data: Vec<u8>,
    },
    RemoteCall {
        object_id: u32,
        behaviour_id: u16,
        rpc_id: u16,
        data: Vec<u8>,
    },
}

impl Message {
    pub fn chat(text: impl Into<String>) -> Self {
        Self::ChatText { text: text.into() }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::ChatText { .. } => MessageKind::ChatText,
            Self::SpawnEntity { .. } => MessageKind::SpawnEntity,
            Self::DespawnEntity { .. } => MessageKind::DespawnEntity,
            Self::FieldUpdate { .. } => MessageKind::FieldUpdate,
            Self::RemoteCall { .. } => MessageKind::RemoteCall,
        }
    }

    pub fn channel(&self) -> Channel {
        self.kind().channel()
    }

    pub fn write_payload(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        match self {
            Self::ChatText { text } => writer.write_string(text)?,
            Self::SpawnEntity {
                prefab_id,
                network_id,
                owner_id,
                position,
            } => {
                writer.write_u16(*prefab_id);
                writer.write_u32(*network_id);
                writer.write_u32(*owner_id);
                writer.write_f32(position.x);
                writer.write_f32(position.y);
                writer.write_f32(position.z);
            }
            Self::DespawnEntity { network_id } => writer.write_u32(*network_id),
            Self::FieldUpdate {
                object_id,
                behaviour_id,
                field_id,
                data,
            } => {
                writer.write_u32(*object_id);
                writer.write_u16(*behaviour_id);
                writer.write_u16(*field_id);
                writer.write_blob(data);
            }
            Self::RemoteCall {
                object_id,
                behaviour_id,
                rpc_id,
                data,
            } => {
                writer.write_u32(*object_id);
                writer.write_u16(*behaviour_id);
                writer.write_u16(*rpc_id);
                writer.write_blob(data);
            }
        }
        Ok(())
    }

    pub fn read_payload(kind: MessageKind, reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let message = match kind {
            MessageKind::ChatText => Self::ChatText {
                text: reader.read_string()?,
            },
            MessageKind::SpawnEntity => Self::SpawnEntity {
                prefab_id: reader.read_u16()?,
                network_id: reader.read_u32()?,
                owner_id: reader.read_u32()?,
                position: Vec3::new(reader.read_f32()?, reader.read_f32()?, reader.read_f32()?),
            },
            MessageKind::DespawnEntity => Self::DespawnEntity {
                network_id: reader.read_u32()?,
            },
            MessageKind::FieldUpdate => Self::FieldUpdate {
                object_id: reader.read_u32()?,
                behaviour_id: reader.read_u16()?,
                field_id: reader.read_u16()?,
                data: reader.read_blob()?.to_vec(),
            },
            MessageKind::RemoteCall => Self::RemoteCall {
                object_id: reader.read_u32()?,
                behaviour_id: reader.read_u16()?,
                rpc_id: reader.read_u16()?,
                data: reader.read_blob()?.to_vec(),
            },
        };
        Ok(message)
    }
}
