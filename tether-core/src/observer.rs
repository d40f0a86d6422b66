//! Shared observer registry.
//!
//! Observers are referenced, not owned: registering returns an [`ObserverId`]
//! that must be used to remove the observer again. Notification code takes a
//! [`snapshot`](ObserverSet::snapshot) and re-checks membership before each
//! call, so callbacks may add or remove observers while a fan-out is running.

use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl ObserverId {
    fn next() -> Self {
        Self(NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Cloneable registry of observers. Clones share the same registrations.
pub struct ObserverSet<T: ?Sized> {
    entries: Arc<RwLock<Vec<(ObserverId, Arc<T>)>>>,
}

impl<T: ?Sized> ObserverSet<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Registers an observer and returns its identity.
    pub fn insert(&self, observer: Arc<T>) -> ObserverId {
        let id = ObserverId::next();
        self.entries.write().push((id, observer));
        id
    }

    /// Removes an observer. Returns false if it was not registered.
    pub fn remove(&self, id: ObserverId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Returns true if the observer is still registered.
    #[must_use]
    pub fn contains(&self, id: ObserverId) -> bool {
        self.entries.read().iter().any(|(entry_id, _)| *entry_id == id)
    }

    /// Returns the registered observers in registration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(ObserverId, Arc<T>)> {
        self.entries.read().clone()
    }

    /// Returns the number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if no observer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Removes every observer.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl<T: ?Sized> Clone for ObserverSet<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T: ?Sized> Default for ObserverSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> std::fmt::Debug for ObserverSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSet")
            .field("len", &self.len())
            .finish()
    }
}
