use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Ordered callback list. Notification works on a snapshot, so callbacks may
/// subscribe or unsubscribe while being notified.
pub struct Subscribers<F: ?Sized> {
    entries: RwLock<Vec<(SubscriptionId, Arc<F>)>>,
    next_id: AtomicU64,
}

impl<F: ?Sized> Default for Subscribers<F> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<F: ?Sized> Subscribers<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: Arc<F>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, callback));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }

    /// Calls every subscriber in registration order. A subscriber that fails
    /// or panics is logged and skipped. Returns how many succeeded.
    pub fn notify(&self, label: &str, call: impl Fn(&F) -> HandlerResult) -> usize {
        let mut succeeded = 0;
        for callback in self.snapshot() {
            match catch_unwind(AssertUnwindSafe(|| call(&callback))) {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(e)) => log::warn!("{} subscriber failed: {}", label, e),
                Err(_) => log::error!("{} subscriber panicked", label),
            }
        }
        succeeded
    }
}
