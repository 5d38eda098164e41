use roster_store::{AttendanceStore, Identity, StoreError};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// In-memory, ordered copy of every enrolled identity.
///
/// Readers take a cheap `Arc` snapshot and keep matching against it while
/// writers build a new list and swap the pointer. A frame that started
/// before an enrollment finishes sees the old list.
#[derive(Default)]
pub struct IdentityCache {
    inner: RwLock<Arc<Vec<Identity>>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Vec<Identity>> {
        Arc::clone(&self.read())
    }

    /// Reload the whole list from the store. Returns the number of identities.
    pub fn refresh<S: AttendanceStore + ?Sized>(&self, store: &S) -> Result<usize, StoreError> {
        let identities = store.list_identities()?;
        let count = identities.len();
        *self.write() = Arc::new(identities);
        tracing::debug!(count, "identity cache refreshed");
        Ok(count)
    }

    /// Replace the entry with the same id, or append.
    pub fn upsert(&self, identity: Identity) {
        let mut guard = self.write();
        let mut next: Vec<Identity> = (**guard).clone();
        match next.iter_mut().find(|existing| existing.id == identity.id) {
            Some(existing) => *existing = identity,
            None => next.push(identity),
        }
        *guard = Arc::new(next);
    }

    pub fn remove(&self, id: i64) -> bool {
        let mut guard = self.write();
        if !guard.iter().any(|identity| identity.id == id) {
            return false;
        }
        let next: Vec<Identity> = guard
            .iter()
            .filter(|identity| identity.id != id)
            .cloned()
            .collect();
        *guard = Arc::new(next);
        true
    }

    pub fn find(&self, id: i64) -> Option<Identity> {
        self.read().iter().find(|identity| identity.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // The guarded value is only ever swapped whole, so a poisoned lock
    // still holds a consistent list.
    fn read(&self) -> RwLockReadGuard<'_, Arc<Vec<Identity>>> {
        self.inner.read().unwrap_or_else(|poisoned| {
            tracing::warn!("identity cache lock poisoned; recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arc<Vec<Identity>>> {
        self.inner.write().unwrap_or_else(|poisoned| {
            tracing::warn!("identity cache lock poisoned; recovering");
            PoisonError::into_inner(poisoned)
        })
    }
}
