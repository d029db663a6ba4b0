use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::replication::NetworkObject;

#[derive(Default)]
struct Entry {
    depth: usize,
    retired: Option<Arc<NetworkObject>>,
}

/// Objects with a remote call handler currently running.
///
/// A handler holds its behaviour's lock, so an object despawned from inside
/// one is parked here and torn down once the last call on it returns.
#[derive(Default)]
pub(crate) struct CallsInFlight {
    entries: Mutex<HashMap<u32, Entry>>,
}

impl CallsInFlight {
    fn entries(&self) -> MutexGuard<'_, HashMap<u32, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn enter(&self, network_id: u32) {
        self.entries().entry(network_id).or_default().depth += 1;
    }

    /// Returns the object when it was retired during the call that just ended.
    pub(crate) fn leave(&self, network_id: u32) -> Option<Arc<NetworkObject>> {
        let mut entries = self.entries();
        let entry = entries.get_mut(&network_id)?;
        entry.depth = entry.depth.saturating_sub(1);
        if entry.depth > 0 {
            return None;
        }
        entries.remove(&network_id).and_then(|entry| entry.retired)
    }

    /// Hands the object straight back when no call is running on it.
    pub(crate) fn retire(&self, object: Arc<NetworkObject>) -> Option<Arc<NetworkObject>> {
        match self.entries().get_mut(&object.network_id()) {
            Some(entry) => {
                entry.retired = Some(object);
                None
            }
            None => Some(object),
        }
    }
}
