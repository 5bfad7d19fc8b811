//! Subscription index
//!
//! Keys map to copy-on-write slices: writers replace the slice for one key,
//! readers clone the `Arc` and iterate a snapshot that never changes under
//! them.

use crate::subscription::{Binding, Subscription, SubscriptionId};
use crate::types::{ResolvedType, TypeKey, View};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

type Snapshot = Arc<[Arc<Subscription>]>;

/// Subscriptions indexed by dispatch key.
#[derive(Default)]
pub struct Registry {
    subscriptions: DashMap<TypeKey, Snapshot>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `binding` under `key`.
    ///
    /// Registering an equal subscription again returns the id it already has.
    pub(crate) fn register(&self, key: TypeKey, binding: Binding) -> SubscriptionId {
        let id = SubscriptionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let subscription = Subscription::new(id, key.clone(), binding);

        let mut entry = self
            .subscriptions
            .entry(key)
            .or_insert_with(|| Arc::from(Vec::new()));

        if let Some(existing) = entry.iter().find(|existing| ***existing == subscription) {
            return existing.id();
        }

        let mut next = Vec::with_capacity(entry.len() + 1);
        next.extend(entry.iter().cloned());
        next.push(Arc::new(subscription));
        *entry = next.into();
        id
    }

    /// Register every `(key, binding)` pair, in order.
    pub(crate) fn register_all(
        &self,
        bindings: impl IntoIterator<Item = (TypeKey, Binding)>,
    ) -> Vec<(TypeKey, SubscriptionId)> {
        bindings
            .into_iter()
            .map(|(key, binding)| {
                let id = self.register(key.clone(), binding);
                (key, id)
            })
            .collect()
    }

    /// Remove the subscription `id` from `key`. Returns `false` if it was
    /// already gone.
    pub(crate) fn unregister(&self, key: &TypeKey, id: SubscriptionId) -> bool {
        let mut removed = false;

        if let Some(mut entry) = self.subscriptions.get_mut(key)
            && entry.iter().any(|subscription| subscription.id() == id)
        {
            let next: Vec<_> = entry
                .iter()
                .filter(|subscription| subscription.id() != id)
                .cloned()
                .collect();
            *entry = next.into();
            removed = true;
        }

        self.subscriptions
            .remove_if(key, |_, subscriptions| subscriptions.is_empty());
        removed
    }

    /// Snapshot of every subscription registered under any key of
    /// `resolved`, each paired with the view for its key.
    pub(crate) fn lookup(&self, resolved: &ResolvedType) -> Vec<(Arc<Subscription>, Option<View>)> {
        let mut matched = Vec::new();

        for (key, view) in resolved.entries() {
            let Some(snapshot) = self.snapshot(key) else {
                continue;
            };
            matched.extend(
                snapshot
                    .iter()
                    .map(|subscription| (Arc::clone(subscription), view.clone())),
            );
        }

        matched
    }

    fn snapshot(&self, key: &TypeKey) -> Option<Snapshot> {
        self.subscriptions.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn clear(&self) {
        self.subscriptions.clear();
    }

    /// Total number of subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.iter().map(|entry| entry.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of subscriptions registered under `key` itself.
    pub fn count(&self, key: &TypeKey) -> usize {
        self.snapshot(key).map_or(0, |snapshot| snapshot.len())
    }
}
