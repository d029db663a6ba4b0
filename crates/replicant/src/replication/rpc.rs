use std::sync::Arc;

use crate::codec::{CodecError, PacketReader, PacketWriter};
use crate::session::{Player, Session, SessionError};

use super::behaviour::{Behaviour, BehaviourTag, NetworkBehaviour};
use super::value::{Value, ValueKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcTarget {
    /// Client to authority.
    Authority,
    /// Authority to one, several or all clients.
    Clients,
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("behaviour '{0}' has no registered rpc table")]
    UnregisteredBehaviour(BehaviourTag),
    #[error("'{name}' is not a remote call of '{behaviour}'")]
    UnknownMethod {
        behaviour: BehaviourTag,
        name: String,
    },
    #[error("rpc id {id} does not exist on '{behaviour}'")]
    UnknownId { behaviour: BehaviourTag, id: u16 },
    #[error("'{name}' targets {declared:?}, not {requested:?}")]
    WrongTarget {
        name: &'static str,
        declared: RpcTarget,
        requested: RpcTarget,
    },
    #[error("calls targeting {0:?} cannot be made from this role")]
    WrongRole(RpcTarget),
    #[error("'{name}' expects {expected:?}, got {found:?}")]
    SignatureMismatch {
        name: &'static str,
        expected: Vec<ValueKind>,
        found: Vec<ValueKind>,
    },
    #[error("argument {index} is not {expected:?}")]
    ArgumentType { index: usize, expected: ValueKind },
    #[error("object {0} does not exist")]
    UnknownObject(u32),
    #[error("object {object} has no '{behaviour}' behaviour")]
    MissingBehaviour { object: u32, behaviour: BehaviourTag },
    #[error("argument blob holds {found} values, expected {expected}")]
    ArgumentCount { expected: usize, found: usize },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("{0}")]
    Handler(String),
}

/// Positional, already type-checked arguments of one call.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcArgs(Vec<Value>);

impl RpcArgs {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    pub fn i32(&self, index: usize) -> Result<i32, RpcError> {
        match self.0.get(index) {
            Some(Value::I32(v)) => Ok(*v),
            _ => Err(RpcError::ArgumentType {
                index,
                expected: ValueKind::I32,
            }),
        }
    }

    pub fn u32(&self, index: usize) -> Result<u32, RpcError> {
        match self.0.get(index) {
            Some(Value::U32(v)) => Ok(*v),
            _ => Err(RpcError::ArgumentType {
                index,
                expected: ValueKind::U32,
            }),
        }
    }

    pub fn f32(&self, index: usize) -> Result<f32, RpcError> {
        match self.0.get(index) {
            Some(Value::F32(v)) => Ok(*v),
            _ => Err(RpcError::ArgumentType {
                index,
                expected: ValueKind::F32,
            }),
        }
    }

    pub fn str(&self, index: usize) -> Result<&str, RpcError> {
        match self.0.get(index) {
            Some(Value::Str(v)) => Ok(v),
            _ => Err(RpcError::ArgumentType {
                index,
                expected: ValueKind::Str,
            }),
        }
    }
}

/// `[u16 count][values...]`, each value in its declared kind's encoding.
pub fn encode_args(args: &[Value]) -> Result<Vec<u8>, RpcError> {
    let count = u16::try_from(args.len()).map_err(|_| RpcError::ArgumentCount {
        expected: u16::MAX as usize,
        found: args.len(),
    })?;

    let mut writer = PacketWriter::with_capacity(2 + args.len() * 4);
    writer.write_u16(count);
    for arg in args {
        arg.write(&mut writer)?;
    }
    Ok(writer.into_vec())
}

pub fn decode_args(data: &[u8], params: &[ValueKind]) -> Result<RpcArgs, RpcError> {
    let mut reader = PacketReader::new(data);
    let count = reader.read_u16()? as usize;
    if count != params.len() {
        return Err(RpcError::ArgumentCount {
            expected: params.len(),
            found: count,
        });
    }

    let values = params
        .iter()
        .map(|&kind| Value::read(kind, &mut reader))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RpcArgs(values))
}

/// Handed to every remote-call handler. The target behaviour is locked for
/// the duration of the call, so handlers must not reach it again through
/// `session.with_behaviour`. Despawning the target from its own handler is
/// fine; teardown runs after the handler returns.
#[derive(Debug, Clone)]
pub struct RpcContext {
    pub session: Session,
    pub sender: Player,
    pub object_id: u32,
    pub behaviour_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcSignature {
    pub name: &'static str,
    pub target: RpcTarget,
    pub params: Vec<ValueKind>,
}

impl RpcSignature {
    pub fn check(&self, args: &[Value]) -> Result<(), RpcError> {
        let found: Vec<ValueKind> = args.iter().map(Value::kind).collect();
        if found != self.params {
            return Err(RpcError::SignatureMismatch {
                name: self.name,
                expected: self.params.clone(),
                found,
            });
        }
        Ok(())
    }
}

type RpcHandler<B> = Box<dyn Fn(&mut B, &RpcContext, &RpcArgs) -> Result<(), RpcError> + Send + Sync>;

struct RpcEntry<B> {
    signature: RpcSignature,
    handler: RpcHandler<B>,
}

/// Static remote-call table of one behaviour type. Ids are table order.
pub struct RpcTable<B> {
    entries: Vec<RpcEntry<B>>,
}

impl<B: NetworkBehaviour> Default for RpcTable<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: NetworkBehaviour> RpcTable<B> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn authority<F>(self, name: &'static str, params: &[ValueKind], handler: F) -> Self
    where
        F: Fn(&mut B, &RpcContext, &RpcArgs) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        self.with_entry(name, RpcTarget::Authority, params, Box::new(handler))
    }

    pub fn clients<F>(self, name: &'static str, params: &[ValueKind], handler: F) -> Self
    where
        F: Fn(&mut B, &RpcContext, &RpcArgs) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        self.with_entry(name, RpcTarget::Clients, params, Box::new(handler))
    }

    fn with_entry(
        mut self,
        name: &'static str,
        target: RpcTarget,
        params: &[ValueKind],
        handler: RpcHandler<B>,
    ) -> Self {
        if self.entries.iter().any(|e| e.signature.name == name) {
            log::warn!("Duplicate rpc '{}' on '{}' ignored", name, B::TAG);
            return self;
        }
        self.entries.push(RpcEntry {
            signature: RpcSignature {
                name,
                target,
                params: params.to_vec(),
            },
            handler,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Type-erased table stored by the session, keyed by behaviour tag.
pub(crate) trait DynRpcTable: Send + Sync {
    fn len(&self) -> usize;
    fn lookup(&self, name: &str) -> Option<(u16, &RpcSignature)>;
    fn signature(&self, id: u16) -> Option<&RpcSignature>;
    fn invoke(
        &self,
        id: u16,
        behaviour: &mut dyn Behaviour,
        ctx: &RpcContext,
        args: &RpcArgs,
    ) -> Result<(), RpcError>;
}

impl<B: NetworkBehaviour> DynRpcTable for RpcTable<B> {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn lookup(&self, name: &str) -> Option<(u16, &RpcSignature)> {
        self.entries
            .iter()
            .position(|e| e.signature.name == name)
            .map(|index| (index as u16, &self.entries[index].signature))
    }

    fn signature(&self, id: u16) -> Option<&RpcSignature> {
        self.entries.get(id as usize).map(|e| &e.signature)
    }

    fn invoke(
        &self,
        id: u16,
        behaviour: &mut dyn Behaviour,
        ctx: &RpcContext,
        args: &RpcArgs,
    ) -> Result<(), RpcError> {
        let entry = self.entries.get(id as usize).ok_or(RpcError::UnknownId {
            behaviour: B::TAG,
            id,
        })?;
        let typed = behaviour
            .as_any_mut()
            .downcast_mut::<B>()
            .ok_or(RpcError::MissingBehaviour {
                object: ctx.object_id,
                behaviour: B::TAG,
            })?;
        (entry.handler)(typed, ctx, args)
    }
}

pub(crate) fn erase<B: NetworkBehaviour>(table: RpcTable<B>) -> Arc<dyn DynRpcTable> {
    Arc::new(table)
}

#[cfg(test)]
#[allow(clippy::approx_constant)]
mod tests {
    use super::*;

    #[test]
    fn test_args_round_trip_in_order() {
        let args = [Value::I32(42), Value::F32(3.14), Value::from("hi")];
        let blob = encode_args(&args).unwrap();
        assert_eq!(&blob[..2], &3u16.to_le_bytes());

        let decoded = decode_args(&blob, &[ValueKind::I32, ValueKind::F32, ValueKind::Str]).unwrap();
        assert_eq!(decoded.i32(0).unwrap(), 42);
        assert_eq!(decoded.f32(1).unwrap().to_bits(), 3.14f32.to_bits());
        assert_eq!(decoded.str(2).unwrap(), "hi");
    }

    #[test]
    fn test_decode_rejects_count_mismatch() {
        let blob = encode_args(&[Value::U32(1)]).unwrap();
        assert!(matches!(
            decode_args(&blob, &[ValueKind::U32, ValueKind::U32]),
            Err(RpcError::ArgumentCount {
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_values() {
        let mut blob = encode_args(&[Value::from("hello")]).unwrap();
        blob.truncate(blob.len() - 2);
        assert!(matches!(
            decode_args(&blob, &[ValueKind::Str]),
            Err(RpcError::Codec(CodecError::BufferUnderrun { .. }))
        ));
    }

    #[test]
    fn test_signature_check() {
        let signature = RpcSignature {
            name: "say",
            target: RpcTarget::Authority,
            params: vec![ValueKind::Str],
        };
        assert!(signature.check(&[Value::from("ok")]).is_ok());
        assert!(matches!(
            signature.check(&[Value::I32(1)]),
            Err(RpcError::SignatureMismatch { .. })
        ));
        assert!(signature.check(&[]).is_err());
    }

    #[test]
    fn test_typed_accessors_reject_wrong_kind() {
        let args = RpcArgs::new(vec![Value::U32(5)]);
        assert_eq!(args.u32(0).unwrap(), 5);
        assert!(args.i32(0).is_err());
        assert!(args.str(1).is_err());
    }
}
