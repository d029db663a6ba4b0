use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use glam::Vec3;

use crate::session::Player;

use super::behaviour::{Behaviour, BehaviourTag, NetworkBehaviour};
use super::field::FieldBinding;

/// Everything known about an object at spawn time.
#[derive(Debug, Clone)]
pub struct SpawnInfo {
    pub network_id: u32,
    pub prefab: String,
    pub prefab_id: u16,
    pub owner_id: u32,
    /// `None` when the owner is a peer this side has no player for.
    pub owner: Option<Player>,
    pub position: Vec3,
    pub authority: bool,
}

impl SpawnInfo {
    pub fn is_locally_owned(&self) -> bool {
        self.owner.as_ref().is_some_and(Player::is_local)
    }
}

pub(crate) type SharedBehaviour = Arc<Mutex<Box<dyn Behaviour>>>;

pub(crate) struct BehaviourSlot {
    tag: BehaviourTag,
    behaviour: SharedBehaviour,
}

pub(crate) fn lock_behaviour(behaviour: &SharedBehaviour) -> MutexGuard<'_, Box<dyn Behaviour>> {
    behaviour
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct NetworkObject {
    info: SpawnInfo,
    spawned: AtomicBool,
    behaviours: Vec<BehaviourSlot>,
}

impl NetworkObject {
    pub(crate) fn new(info: SpawnInfo, behaviours: Vec<Box<dyn Behaviour>>) -> Self {
        let behaviours = behaviours
            .into_iter()
            .map(|behaviour| BehaviourSlot {
                tag: behaviour.tag(),
                behaviour: Arc::new(Mutex::new(behaviour)),
            })
            .collect();

        Self {
            info,
            spawned: AtomicBool::new(false),
            behaviours,
        }
    }

    pub fn network_id(&self) -> u32 {
        self.info.network_id
    }

    pub fn prefab(&self) -> &str {
        &self.info.prefab
    }

    pub fn prefab_id(&self) -> u16 {
        self.info.prefab_id
    }

    pub fn owner_id(&self) -> u32 {
        self.info.owner_id
    }

    pub fn owner(&self) -> Option<&Player> {
        self.info.owner.as_ref()
    }

    pub fn is_locally_owned(&self) -> bool {
        self.info.is_locally_owned()
    }

    pub fn position(&self) -> Vec3 {
        self.info.position
    }

    pub fn info(&self) -> &SpawnInfo {
        &self.info
    }

    pub fn is_spawned(&self) -> bool {
        self.spawned.load(Ordering::Acquire)
    }

    pub fn behaviour_count(&self) -> usize {
        self.behaviours.len()
    }

    pub fn behaviour_tags(&self) -> Vec<BehaviourTag> {
        self.behaviours.iter().map(|slot| slot.tag).collect()
    }

    pub fn behaviour_id(&self, tag: BehaviourTag) -> Option<u16> {
        self.behaviours
            .iter()
            .position(|slot| slot.tag == tag)
            .map(|index| index as u16)
    }

    pub(crate) fn behaviour(&self, id: u16) -> Option<(BehaviourTag, SharedBehaviour)> {
        self.behaviours
            .get(id as usize)
            .map(|slot| (slot.tag, Arc::clone(&slot.behaviour)))
    }

    /// Runs `f` on the first behaviour of type `B`.
    pub fn with_behaviour<B: NetworkBehaviour, R>(&self, f: impl FnOnce(&mut B) -> R) -> Option<R> {
        let slot = self.behaviours.iter().find(|slot| slot.tag == B::TAG)?;
        let mut guard = lock_behaviour(&slot.behaviour);
        guard.as_any_mut().downcast_mut::<B>().map(f)
    }

    /// Hands every field its wire address and outbound route.
    pub(crate) fn bind_fields(&self, binding: impl Fn(u16, u16) -> FieldBinding) {
        for (behaviour_id, slot) in self.behaviours.iter().enumerate() {
            let mut behaviour = lock_behaviour(&slot.behaviour);
            for (field_id, field) in behaviour.fields_mut().into_iter().enumerate() {
                field.bind(binding(behaviour_id as u16, field_id as u16));
            }
        }
    }

    pub(crate) fn mark_spawned(&self) {
        self.spawned.store(true, Ordering::Release);
        for slot in &self.behaviours {
            lock_behaviour(&slot.behaviour).on_spawn(&self.info);
        }
    }

    pub(crate) fn mark_despawned(&self) {
        if !self.spawned.swap(false, Ordering::AcqRel) {
            return;
        }
        for slot in &self.behaviours {
            let mut behaviour = lock_behaviour(&slot.behaviour);
            for field in behaviour.fields_mut() {
                field.unbind();
            }
            behaviour.on_despawn(&self.info);
        }
    }
}

impl fmt::Debug for NetworkObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkObject")
            .field("network_id", &self.info.network_id)
            .field("prefab", &self.info.prefab)
            .field("owner_id", &self.info.owner_id)
            .field("position", &self.info.position)
            .field("spawned", &self.is_spawned())
            .field("behaviours", &self.behaviour_tags())
            .finish()
    }
}
