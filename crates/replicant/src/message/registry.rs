use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::codec::{CodecError, PacketReader, PacketWriter};
use crate::event::{HandlerResult, SubscriptionId, Subscribers};
use crate::session::Player;

use super::message::{Message, MessageKind};

pub type MessageCallback = dyn Fn(&Message, &Player) -> HandlerResult + Send + Sync;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("message kind {} is not registered", .0.as_str())]
    Unregistered(MessageKind),
    #[error("malformed {} message: {source}", .kind.as_str())]
    Malformed {
        kind: MessageKind,
        #[source]
        source: CodecError,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Default)]
struct Codes {
    by_kind: HashMap<MessageKind, u16>,
    by_code: HashMap<u16, MessageKind>,
    next_code: u16,
}

/// Maps message kinds to wire codes and fans decoded messages out to subscribers.
/// Every peer must register the same kinds in the same order.
pub struct MessageRegistry {
    codes: RwLock<Codes>,
    subscribers: HashMap<MessageKind, Subscribers<MessageCallback>>,
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self {
            codes: RwLock::new(Codes {
                next_code: 1,
                ..Default::default()
            }),
            subscribers: MessageKind::ALL
                .iter()
                .map(|&kind| (kind, Subscribers::new()))
                .collect(),
        }
    }

    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register_defaults();
        registry
    }

    fn codes(&self) -> RwLockReadGuard<'_, Codes> {
        self.codes.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn codes_mut(&self) -> RwLockWriteGuard<'_, Codes> {
        self.codes.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the kind's wire code, assigning the next one on first registration.
    pub fn register(&self, kind: MessageKind) -> u16 {
        let mut codes = self.codes_mut();
        if let Some(&code) = codes.by_kind.get(&kind) {
            return code;
        }
        let code = codes.next_code;
        codes.next_code += 1;
        codes.by_kind.insert(kind, code);
        codes.by_code.insert(code, kind);
        log::debug!("Registered {} as wire code {}", kind.as_str(), code);
        code
    }

    pub fn register_defaults(&self) {
        for kind in MessageKind::ALL {
            self.register(kind);
        }
    }

    pub fn code_of(&self, kind: MessageKind) -> Option<u16> {
        self.codes().by_kind.get(&kind).copied()
    }

    pub fn kind_of(&self, code: u16) -> Option<MessageKind> {
        self.codes().by_code.get(&code).copied()
    }

    pub fn is_registered(&self, kind: MessageKind) -> bool {
        self.code_of(kind).is_some()
    }

    pub fn serialize(&self, message: &Message) -> Result<Vec<u8>, RegistryError> {
        let kind = message.kind();
        let code = self
            .code_of(kind)
            .ok_or(RegistryError::Unregistered(kind))?;

        let mut writer = PacketWriter::with_capacity(32);
        writer.write_u16(code);
        message.write_payload(&mut writer)?;
        Ok(writer.into_vec())
    }

    /// `Ok(None)` when the wire code is unknown to this peer.
    pub fn deserialize(&self, data: &[u8]) -> Result<Option<Message>, RegistryError> {
        let mut reader = PacketReader::new(data);
        let code = reader.read_u16()?;
        let Some(kind) = self.kind_of(code) else {
            return Ok(None);
        };

        Message::read_payload(kind, &mut reader)
            .map(Some)
            .map_err(|source| RegistryError::Malformed { kind, source })
    }

    pub fn subscribe<F>(&self, kind: MessageKind, callback: F) -> SubscriptionId
    where
        F: Fn(&Message, &Player) -> HandlerResult + Send + Sync + 'static,
    {
        let callback: Arc<MessageCallback> = Arc::new(callback);
        self.subscribers_for(kind).subscribe(callback)
    }

    pub fn unsubscribe(&self, kind: MessageKind, id: SubscriptionId) -> bool {
        self.subscribers_for(kind).unsubscribe(id)
    }

    /// Runs every subscriber of the message's kind in registration order.
    pub fn dispatch(&self, message: &Message, sender: &Player) -> usize {
        let kind = message.kind();
        self.subscribers_for(kind)
            .notify(kind.as_str(), |callback| callback(message, sender))
    }

    fn subscribers_for(&self, kind: MessageKind) -> &Subscribers<MessageCallback> {
        // Every kind gets a list in `new`, so the lookup cannot miss.
        &self.subscribers[&kind]
    }
}
