use std::collections::HashMap;

use super::behaviour::Behaviour;
use super::object::{NetworkObject, SpawnInfo};

/// Application hook that builds and tears down the local side of an object.
pub trait PrefabFactory: Send + Sync + 'static {
    /// Behaviours for a new object, in the order every peer must use.
    fn instantiate(&self, info: &SpawnInfo) -> Vec<Box<dyn Behaviour>>;

    fn destroy(&self, _object: &NetworkObject) {}
}

/// Factory for sessions whose objects carry no behaviours.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyFactory;

impl PrefabFactory for EmptyFactory {
    fn instantiate(&self, _info: &SpawnInfo) -> Vec<Box<dyn Behaviour>> {
        Vec::new()
    }
}

/// Prefab names and their wire ids. Ids start at 1 in registration order.
#[derive(Debug, Clone, Default)]
pub struct PrefabRegistry {
    by_name: HashMap<String, u16>,
    names: Vec<String>,
}

impl PrefabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str) -> u16 {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        self.names.push(name.to_string());
        let id = self.names.len() as u16;
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn id_of(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, id: u16) -> Option<&str> {
        let index = (id as usize).checked_sub(1)?;
        self.names.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}
