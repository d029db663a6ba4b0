use std::any::Any;
use std::fmt;

use super::field::SyncField;
use super::object::SpawnInfo;
use super::rpc::RpcTable;

/// Stable identity of a behaviour type, identical on every peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BehaviourTag(pub &'static str);

impl fmt::Display for BehaviourTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Application-defined capability attached to a replicated object.
///
/// Field ids are the positions in `fields_mut`, remote-call ids the positions
/// in `rpc_table`; both must enumerate identically on every peer.
pub trait NetworkBehaviour: Send + Sized + 'static {
    const TAG: BehaviourTag;

    fn fields_mut(&mut self) -> Vec<&mut dyn SyncField> {
        Vec::new()
    }

    fn rpc_table() -> RpcTable<Self> {
        RpcTable::<Self>::new()
    }

    fn on_spawn(&mut self, _info: &SpawnInfo) {}

    fn on_despawn(&mut self, _info: &SpawnInfo) {}
}

/// Object-safe face of `NetworkBehaviour`, implemented for every behaviour.
pub trait Behaviour: Send {
    fn tag(&self) -> BehaviourTag;
    fn fields_mut(&mut self) -> Vec<&mut dyn SyncField>;
    fn on_spawn(&mut self, info: &SpawnInfo);
    fn on_despawn(&mut self, info: &SpawnInfo);
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<B: NetworkBehaviour> Behaviour for B {
    fn tag(&self) -> BehaviourTag {
        B::TAG
    }

    fn fields_mut(&mut self) -> Vec<&mut dyn SyncField> {
        NetworkBehaviour::fields_mut(self)
    }

    fn on_spawn(&mut self, info: &SpawnInfo) {
        NetworkBehaviour::on_spawn(self, info)
    }

    fn on_despawn(&mut self, info: &SpawnInfo) {
        NetworkBehaviour::on_despawn(self, info)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
