use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::invocation::{CancelHandle, InvocationScope};

#[derive(Debug)]
struct InflightEntry {
    invocation_id: u64,
    cancel: CancelHandle,
}

/// Tracks which scopes currently have a live worker.
///
/// A scope holds at most one invocation; a second request for the same
/// item (or a second full batch) is refused until the first one releases.
#[derive(Debug, Default)]
pub struct InflightRegistry {
    active: HashMap<InvocationScope, InflightEntry>,
}

impl InflightRegistry {
    pub fn reserve(
        &mut self,
        scope: InvocationScope,
        invocation_id: u64,
        cancel: CancelHandle,
    ) -> bool {
        match self.active.entry(scope) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(InflightEntry {
                    invocation_id,
                    cancel,
                });
                true
            }
        }
    }

    /// Releases `scope` only if it is still held by `invocation_id`.
    pub fn release(&mut self, scope: &InvocationScope, invocation_id: u64) -> bool {
        match self.active.get(scope) {
            Some(entry) if entry.invocation_id == invocation_id => {
                self.active.remove(scope);
                true
            }
            _ => false,
        }
    }

    /// Cancels the scope's invocation and frees the scope at once, so a
    /// replacement can launch while the old process is still shutting down.
    pub fn cancel(&mut self, scope: &InvocationScope) -> bool {
        let Some(entry) = self.active.remove(scope) else {
            return false;
        };
        entry.cancel.cancel();
        true
    }

    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.active.len();
        for (_, entry) in self.active.drain() {
            entry.cancel.cancel();
        }
        cancelled
    }

    pub fn is_active(&self, scope: &InvocationScope) -> bool {
        self.active.contains_key(scope)
    }

    pub fn active_scopes(&self) -> Vec<InvocationScope> {
        self.active.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use welltrack_protocol::ItemId;

    use super::InflightRegistry;
    use crate::invocation::{CancelHandle, InvocationScope};

    #[test]
    fn stale_release_does_not_free_newer_reservation() {
        let mut registry = InflightRegistry::default();
        let scope = InvocationScope::Item(ItemId::new("C07"));

        assert!(registry.reserve(scope.clone(), 7, CancelHandle::default()));
        assert!(!registry.release(&scope, 6));
        assert!(registry.is_active(&scope));
        assert!(registry.release(&scope, 7));
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_frees_scope_for_a_replacement() {
        let mut registry = InflightRegistry::default();
        let scope = InvocationScope::Batch;
        let first = CancelHandle::default();
        registry.reserve(scope.clone(), 1, first.clone());

        assert!(registry.cancel(&scope));
        assert!(first.is_cancelled());
        assert!(registry.reserve(scope.clone(), 2, CancelHandle::default()));
        assert!(!registry.release(&scope, 1));
        assert!(registry.is_active(&scope));
    }

    #[test]
    fn cancel_all_flips_every_handle() {
        let mut registry = InflightRegistry::default();
        let batch = CancelHandle::default();
        let item = CancelHandle::default();
        registry.reserve(InvocationScope::Batch, 1, batch.clone());
        registry.reserve(InvocationScope::Item(ItemId::new("A01")), 2, item.clone());

        assert_eq!(registry.cancel_all(), 2);
        assert!(batch.is_cancelled());
        assert!(item.is_cancelled());
        assert!(registry.is_empty());
    }
}
