mod behaviour;
mod field;
mod object;
mod prefab;
mod rpc;
mod value;

pub use behaviour::{Behaviour, BehaviourTag, NetworkBehaviour};
pub use field::{Field, FieldAddress, FieldBinding, SyncField};
pub use object::{NetworkObject, SpawnInfo};
pub use prefab::{EmptyFactory, PrefabFactory, PrefabRegistry};
pub use rpc::{
    RpcArgs, RpcContext, RpcError, RpcSignature, RpcTable, RpcTarget, decode_args, encode_args,
};
pub use value::{FieldValue, Value, ValueKind};

pub(crate) use object::lock_behaviour;
pub(crate) use rpc::{DynRpcTable, erase};
