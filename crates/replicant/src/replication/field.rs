use std::fmt;
use std::sync::Arc;

use crate::codec::{CodecError, PacketReader, PacketWriter};
use crate::message::{Message, MessageRegistry};
use crate::session::{Outbound, Outbox, Route};

use super::value::{FieldValue, ValueKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldAddress {
    pub object_id: u32,
    pub behaviour_id: u16,
    pub field_id: u16,
}

/// Where a field's writes go once its object is spawned.
#[derive(Clone)]
pub struct FieldBinding {
    pub address: FieldAddress,
    pub route: Route,
    /// Only the owning peer originates updates.
    pub owned: bool,
    registry: Arc<MessageRegistry>,
    outbox: Outbox,
}

impl FieldBinding {
    pub fn new(
        address: FieldAddress,
        route: Route,
        owned: bool,
        registry: Arc<MessageRegistry>,
        outbox: Outbox,
    ) -> Self {
        Self {
            address,
            route,
            owned,
            registry,
            outbox,
        }
    }

    fn emit(&self, data: Vec<u8>) {
        let message = Message::FieldUpdate {
            object_id: self.address.object_id,
            behaviour_id: self.address.behaviour_id,
            field_id: self.address.field_id,
            data,
        };
        match self.registry.serialize(&message) {
            Ok(bytes) => {
                let queued = self.outbox.push(Outbound {
                    route: self.route.clone(),
                    bytes,
                    channel: message.channel(),
                });
                if !queued {
                    log::debug!("Field update for {:?} dropped, session stopped", self.address);
                }
            }
            Err(e) => log::warn!("Field update for {:?} not sent: {}", self.address, e),
        }
    }
}

impl fmt::Debug for FieldBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldBinding")
            .field("address", &self.address)
            .field("route", &self.route)
            .field("owned", &self.owned)
            .finish()
    }
}

/// Type-erased view of a field, used to bind and apply updates.
pub trait SyncField: Send {
    fn kind(&self) -> ValueKind;
    fn bind(&mut self, binding: FieldBinding);
    fn unbind(&mut self);
    /// Decodes a remote value and stores it without emitting an update.
    fn apply(&mut self, data: &[u8]) -> Result<(), CodecError>;
    fn encoded(&self) -> Result<Vec<u8>, CodecError>;
}

type ChangeCallback<T> = Box<dyn Fn(&T, &T) + Send>;

/// A replicated value owned by a behaviour.
pub struct Field<T: FieldValue> {
    value: T,
    binding: Option<FieldBinding>,
    on_change: Option<ChangeCallback<T>>,
}

impl<T: FieldValue> Field<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            binding: None,
            on_change: None,
        }
    }

    /// `callback(old, new)` runs after every local or remote change.
    pub fn with_on_change(value: T, callback: impl Fn(&T, &T) + Send + 'static) -> Self {
        Self {
            value,
            binding: None,
            on_change: Some(Box::new(callback)),
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn binding(&self) -> Option<&FieldBinding> {
        self.binding.as_ref()
    }

    /// Returns whether the value changed.
    pub fn set(&mut self, value: T) -> bool {
        if self.value.same(&value) {
            return false;
        }

        let old = std::mem::replace(&mut self.value, value);
        if let Some(callback) = &self.on_change {
            callback(&old, &self.value);
        }

        if let Some(binding) = self.binding.as_ref().filter(|b| b.owned) {
            match self.encoded() {
                Ok(data) => binding.emit(data),
                Err(e) => log::warn!("Field {:?} not encodable: {}", binding.address, e),
            }
        }
        true
    }
}

impl<T: FieldValue> SyncField for Field<T> {
    fn kind(&self) -> ValueKind {
        T::KIND
    }

    fn bind(&mut self, binding: FieldBinding) {
        self.binding = Some(binding);
    }

    fn unbind(&mut self) {
        self.binding = None;
    }

    fn apply(&mut self, data: &[u8]) -> Result<(), CodecError> {
        let mut reader = PacketReader::new(data);
        let value = T::decode(&mut reader)?;
        if self.value.same(&value) {
            return Ok(());
        }

        let old = std::mem::replace(&mut self.value, value);
        if let Some(callback) = &self.on_change {
            callback(&old, &self.value);
        }
        Ok(())
    }

    fn encoded(&self) -> Result<Vec<u8>, CodecError> {
        let mut writer = PacketWriter::with_capacity(8);
        self.value.encode(&mut writer)?;
        Ok(writer.into_vec())
    }
}

impl<T: FieldValue + Default> Default for Field<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: FieldValue> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("value", &self.value)
            .field("binding", &self.binding)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn bound<T: FieldValue>(
        value: T,
        owned: bool,
    ) -> (Field<T>, mpsc::UnboundedReceiver<Outbound>, Arc<MessageRegistry>) {
        let registry = Arc::new(MessageRegistry::with_defaults());
        let (outbox, rx) = Outbox::channel();
        let mut field = Field::new(value);
        field.bind(FieldBinding::new(
            FieldAddress {
                object_id: 5,
                behaviour_id: 1,
                field_id: 2,
            },
            Route::Broadcast {
                include_local: false,
            },
            owned,
            Arc::clone(&registry),
            outbox,
        ));
        (field, rx, registry)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(outbound) = rx.try_recv() {
            out.push(outbound);
        }
        out
    }

    #[test]
    fn test_same_value_twice_emits_once() {
        let (mut field, mut rx, registry) = bound(10i32, true);

        assert!(field.set(25));
        assert!(!field.set(25));

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);

        let message = registry.deserialize(&sent[0].bytes).unwrap().unwrap();
        assert_eq!(message.kind(), MessageKind::FieldUpdate);
        assert_eq!(
            message,
            Message::FieldUpdate {
                object_id: 5,
                behaviour_id: 1,
                field_id: 2,
                data: 25i32.to_le_bytes().to_vec(),
            }
        );
    }

    #[test]
    fn test_repeated_nan_emits_once() {
        let (mut field, mut rx, _) = bound(0.0f32, true);

        assert!(field.set(f32::NAN));
        assert!(!field.set(f32::NAN));
        assert_eq!(drain(&mut rx).len(), 1);

        assert!(field.set(-0.0));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_non_owned_never_emits() {
        let (mut field, mut rx, _) = bound(String::from("a"), false);
        assert!(field.set("b".to_string()));
        assert!(field.set("c".to_string()));
        assert_eq!(field.get(), "c");
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_unbound_field_is_local_only() {
        let mut field = Field::new(1.5f32);
        assert!(field.set(2.5));
        assert_eq!(*field.get(), 2.5);
        assert!(field.binding().is_none());
    }

    #[test]
    fn test_apply_runs_callback_without_emitting() {
        let changes = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&changes);
        let (outbox, mut rx) = Outbox::channel();

        let mut field = Field::with_on_change(0u32, move |old, new| {
            seen.lock().unwrap().push((*old, *new));
        });
        field.bind(FieldBinding::new(
            FieldAddress {
                object_id: 1,
                behaviour_id: 0,
                field_id: 0,
            },
            Route::Server,
            true,
            Arc::new(MessageRegistry::with_defaults()),
            outbox,
        ));

        field.apply(&7u32.to_le_bytes()).unwrap();
        assert_eq!(*field.get(), 7);
        assert_eq!(*changes.lock().unwrap(), vec![(0, 7)]);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_apply_rejects_short_data() {
        let mut field = Field::new(0i32);
        assert!(field.apply(&[1, 2]).is_err());
        assert_eq!(*field.get(), 0);
    }
}
