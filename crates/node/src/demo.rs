use glam::Vec3;
use replicant::{
    Behaviour, BehaviourTag, Field, NetworkBehaviour, NetworkObject, PrefabFactory, RpcTable,
    SpawnInfo, SyncField, Value, ValueKind,
};

pub const PLAYER_PREFAB: &str = "PlayerPrefab";
pub const ENEMY_PREFAB: &str = "EnemyPrefab";

/// Registration order fixes the wire ids, so every node uses this list.
pub const PREFABS: [&str; 2] = [PLAYER_PREFAB, ENEMY_PREFAB];

pub struct Avatar {
    pub health: Field<i32>,
}

impl Avatar {
    fn new(network_id: u32) -> Self {
        Self {
            health: Field::with_on_change(100, move |old, new| {
                log::info!("#{} health {} -> {}", network_id, old, new);
            }),
        }
    }
}

impl NetworkBehaviour for Avatar {
    const TAG: BehaviourTag = BehaviourTag("Avatar");

    fn fields_mut(&mut self) -> Vec<&mut dyn SyncField> {
        vec![&mut self.health]
    }

    fn rpc_table() -> RpcTable<Self> {
        RpcTable::<Self>::new()
            .authority("say", &[ValueKind::Str], |_avatar, ctx, args| {
                let text = args.str(0)?;
                log::info!("{} says '{}' through #{}", ctx.sender, text, ctx.object_id);
                ctx.session.call_all::<Avatar>(
                    ctx.object_id,
                    "announce",
                    &[Value::from(format!("player {}: {}", ctx.sender.id(), text))],
                )
            })
            .clients("announce", &[ValueKind::Str], |_avatar, ctx, args| {
                log::info!("[#{}] {}", ctx.object_id, args.str(0)?);
                Ok(())
            })
    }

    fn on_spawn(&mut self, info: &SpawnInfo) {
        log::debug!(
            "Avatar #{} up at {} (owner {}, local: {})",
            info.network_id,
            info.position,
            info.owner_id,
            info.is_locally_owned()
        );
    }
}

pub struct DemoFactory;

impl PrefabFactory for DemoFactory {
    fn instantiate(&self, info: &SpawnInfo) -> Vec<Box<dyn Behaviour>> {
        match info.prefab.as_str() {
            PLAYER_PREFAB => vec![Box::new(Avatar::new(info.network_id))],
            _ => Vec::new(),
        }
    }

    fn destroy(&self, object: &NetworkObject) {
        log::debug!("{} #{} destroyed", object.prefab(), object.network_id());
    }
}

/// Players are spread on a ring so spawns do not overlap.
pub fn spawn_point(player_id: u32) -> Vec3 {
    let angle = player_id as f32 * std::f32::consts::FRAC_PI_4;
    Vec3::new(angle.cos() * 5.0, 0.0, angle.sin() * 5.0)
}
