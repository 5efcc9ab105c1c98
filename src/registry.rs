//! Subscription registry
//!
//! Owns the mapping from event type to its ordered subscriber list, plus an
//! id index and a group index. All indexes are updated under one write lock.
//! Lookups return owned snapshots so no lock is held while handlers run.

use crate::error::{EventError, Result};
use crate::handler::EventHandler;
use crate::subscription::{SubscribeOptions, Subscription};
use crate::types::EventType;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Default)]
struct Indexes {
    /// event type → subscriptions in dispatch order
    by_type: HashMap<EventType, Vec<Subscription>>,

    /// subscription id → event type
    by_id: HashMap<String, EventType>,

    /// group label → subscription ids
    by_group: HashMap<String, Vec<String>>,
}

impl Indexes {
    fn detach(&mut self, id: &str) -> Option<Subscription> {
        let event_type = self.by_id.remove(id)?;
        let subs = self.by_type.get_mut(&event_type)?;
        let pos = subs.iter().position(|s| s.id == id)?;
        let removed = subs.remove(pos);
        if subs.is_empty() {
            self.by_type.remove(&event_type);
        }
        if let Some(group) = &removed.group {
            if let Some(ids) = self.by_group.get_mut(group) {
                ids.retain(|gid| gid != id);
                if ids.is_empty() {
                    self.by_group.remove(group);
                }
            }
        }
        Some(removed)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Subscription> {
        let event_type = self.by_id.get(id)?;
        self.by_type
            .get_mut(event_type)?
            .iter_mut()
            .find(|s| s.id == id)
    }
}

/// Thread-safe subscription registry
#[derive(Default)]
pub struct SubscriptionRegistry {
    indexes: RwLock<Indexes>,
    sequence: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription and re-sort that type's list
    pub fn add(
        &self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        if event_type.is_empty() {
            return Err(EventError::Config(
                "Event type cannot be empty".to_string(),
            ));
        }
        if matches!(options.group.as_deref(), Some("")) {
            return Err(EventError::Config(
                "Subscription group cannot be empty".to_string(),
            ));
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let subscription = Subscription::new(event_type.clone(), handler, options, sequence);

        let mut indexes = self.indexes.write().unwrap_or_else(PoisonError::into_inner);
        let subs = indexes.by_type.entry(event_type).or_default();
        subs.push(subscription.clone());
        subs.sort_by(Subscription::dispatch_order);
        indexes
            .by_id
            .insert(subscription.id.clone(), subscription.event_type.clone());
        if let Some(group) = &subscription.group {
            indexes
                .by_group
                .entry(group.clone())
                .or_default()
                .push(subscription.id.clone());
        }

        Ok(subscription)
    }

    /// Remove one subscription by id
    pub fn remove(&self, id: &str) -> Result<Subscription> {
        let mut indexes = self.indexes.write().unwrap_or_else(PoisonError::into_inner);
        indexes
            .detach(id)
            .ok_or_else(|| EventError::SubscriptionNotFound(id.to_string()))
    }

    /// Remove every subscription registered for exactly `event_type`
    pub fn remove_all(&self, event_type: &EventType) -> usize {
        let mut indexes = self.indexes.write().unwrap_or_else(PoisonError::into_inner);
        let ids: Vec<String> = indexes
            .by_type
            .get(event_type)
            .map(|subs| subs.iter().map(|s| s.id.clone()).collect())
            .unwrap_or_default();
        ids.iter().filter(|id| indexes.detach(id).is_some()).count()
    }

    /// Remove every subscription carrying `group`
    pub fn remove_group(&self, group: &str) -> usize {
        let mut indexes = self.indexes.write().unwrap_or_else(PoisonError::into_inner);
        let ids = indexes.by_group.get(group).cloned().unwrap_or_default();
        ids.iter().filter(|id| indexes.detach(id).is_some()).count()
    }

    /// Suspend or resume delivery to a subscription without removing it
    pub fn set_active(&self, id: &str, active: bool) -> Result<()> {
        let mut indexes = self.indexes.write().unwrap_or_else(PoisonError::into_inner);
        let subscription = indexes
            .find_mut(id)
            .ok_or_else(|| EventError::SubscriptionNotFound(id.to_string()))?;
        if subscription.active != active {
            subscription.active = active;
            subscription.deactivated_at = (!active).then(Utc::now);
        }
        Ok(())
    }

    /// Remove subscriptions suspended since before `cutoff`
    pub fn remove_inactive(&self, cutoff: DateTime<Utc>) -> usize {
        let mut indexes = self.indexes.write().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<String> = indexes
            .by_type
            .values()
            .flatten()
            .filter(|s| !s.active && s.deactivated_at.is_some_and(|at| at < cutoff))
            .map(|s| s.id.clone())
            .collect();
        stale.iter().filter(|id| indexes.detach(id).is_some()).count()
    }

    pub fn active_count(&self) -> usize {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        indexes.by_type.values().flatten().filter(|s| s.active).count()
    }

    /// Active subscriptions receiving an event of `event_type`, in dispatch order
    ///
    /// Wildcard subscriptions are merged with type-specific ones.
    pub fn matching(&self, event_type: &EventType) -> Vec<Subscription> {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        let exact = indexes.by_type.get(event_type);
        let wildcard = if event_type.is_wildcard() {
            None
        } else {
            indexes.by_type.get(&EventType::all())
        };

        let mut subs: Vec<Subscription> = exact
            .into_iter()
            .chain(wildcard)
            .flat_map(|list| list.iter().filter(|s| s.active).cloned())
            .collect();
        if wildcard.is_some() && exact.is_some() {
            subs.sort_by(Subscription::dispatch_order);
        }
        subs
    }

    pub fn get(&self, id: &str) -> Option<Subscription> {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        let event_type = indexes.by_id.get(id)?;
        indexes
            .by_type
            .get(event_type)?
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    /// Number of subscriptions registered for exactly `event_type`
    pub fn count(&self, event_type: &EventType) -> usize {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        indexes.by_type.get(event_type).map_or(0, Vec::len)
    }

    pub fn total(&self) -> usize {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        indexes.by_id.len()
    }

    /// Subscription count per group label
    pub fn group_counts(&self) -> HashMap<String, usize> {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        indexes
            .by_group
            .iter()
            .map(|(group, ids)| (group.clone(), ids.len()))
            .collect()
    }

    /// Subscription count per event type
    pub fn type_counts(&self) -> HashMap<EventType, usize> {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        indexes
            .by_type
            .iter()
            .map(|(t, subs)| (t.clone(), subs.len()))
            .collect()
    }

    pub fn list(&self) -> Vec<Subscription> {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<Subscription> = indexes.by_type.values().flatten().cloned().collect();
        all.sort_by_key(|s| s.sequence);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, HandlerResult};
    use crate::types::Event;

    fn noop() -> Arc<dyn EventHandler> {
        handler_fn(|_event: Arc<Event>| async move { HandlerResult::Ok(()) })
    }

    fn add(registry: &SubscriptionRegistry, t: &str, priority: i32) -> Subscription {
        registry
            .add(t.into(), noop(), SubscribeOptions::default().priority(priority))
            .unwrap()
    }

    #[test]
    fn test_add_orders_by_priority_with_stable_ties() {
        let registry = SubscriptionRegistry::new();
        let a = add(&registry, "player.play", 100);
        let b = add(&registry, "player.play", 300);
        let c = add(&registry, "player.play", 100);
        let d = add(&registry, "player.play", 0);

        let ids: Vec<String> = registry
            .matching(&"player.play".into())
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![b.id, a.id, c.id, d.id]);
    }

    #[test]
    fn test_empty_type_rejected() {
        let registry = SubscriptionRegistry::new();
        let err = registry
            .add("".into(), noop(), SubscribeOptions::default())
            .unwrap_err();
        assert_eq!(err.as_label(), "config");
    }

    #[test]
    fn test_remove_updates_every_index() {
        let registry = SubscriptionRegistry::new();
        let sub = registry
            .add("a".into(), noop(), SubscribeOptions::default().group("ui"))
            .unwrap();
        assert_eq!(registry.total(), 1);
        assert_eq!(registry.group_counts()["ui"], 1);

        registry.remove(&sub.id).unwrap();
        assert_eq!(registry.total(), 0);
        assert_eq!(registry.count(&"a".into()), 0);
        assert!(registry.group_counts().is_empty());
        assert!(registry.get(&sub.id).is_none());

        let err = registry.remove(&sub.id).unwrap_err();
        assert_eq!(err.as_label(), "subscription_not_found");
    }

    #[test]
    fn test_remove_all_for_type() {
        let registry = SubscriptionRegistry::new();
        add(&registry, "a", 1);
        add(&registry, "a", 2);
        add(&registry, "b", 1);

        assert_eq!(registry.remove_all(&"a".into()), 2);
        assert_eq!(registry.count(&"a".into()), 0);
        assert_eq!(registry.count(&"b".into()), 1);
        assert_eq!(registry.total(), 1);
    }

    #[test]
    fn test_remove_group_spans_types() {
        let registry = SubscriptionRegistry::new();
        registry
            .add("a".into(), noop(), SubscribeOptions::default().group("plugin-x"))
            .unwrap();
        registry
            .add("b".into(), noop(), SubscribeOptions::default().group("plugin-x"))
            .unwrap();
        add(&registry, "b", 1);

        assert_eq!(registry.remove_group("plugin-x"), 2);
        assert_eq!(registry.total(), 1);
        assert_eq!(registry.remove_group("plugin-x"), 0);
    }

    #[test]
    fn test_wildcard_merged_in_priority_order() {
        let registry = SubscriptionRegistry::new();
        let exact_low = add(&registry, "player.play", 10);
        let wild_high = add(&registry, "*", 50);
        let exact_high = add(&registry, "player.play", 50);

        let ids: Vec<String> = registry
            .matching(&"player.play".into())
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![wild_high.id.clone(), exact_high.id, exact_low.id]);

        let other: Vec<String> = registry
            .matching(&"ui.render".into())
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(other, vec![wild_high.id]);
    }

    #[test]
    fn test_inactive_subscriptions_are_skipped() {
        let registry = SubscriptionRegistry::new();
        let muted = add(&registry, "player.play", 200);
        let live = add(&registry, "player.play", 100);

        registry.set_active(&muted.id, false).unwrap();
        let ids: Vec<String> = registry
            .matching(&"player.play".into())
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![live.id.clone()]);
        assert_eq!(registry.total(), 2);
        assert_eq!(registry.active_count(), 1);
        assert!(registry.get(&muted.id).unwrap().deactivated_at.is_some());

        registry.set_active(&muted.id, true).unwrap();
        assert_eq!(registry.matching(&"player.play".into()).len(), 2);
        assert!(registry.get(&muted.id).unwrap().deactivated_at.is_none());

        let err = registry.set_active("missing", false).unwrap_err();
        assert_eq!(err.as_label(), "subscription_not_found");
    }

    #[test]
    fn test_remove_inactive_only_takes_stale_suspensions() {
        let registry = SubscriptionRegistry::new();
        let stale = registry
            .add("a".into(), noop(), SubscribeOptions::default().group("ui"))
            .unwrap();
        let active = add(&registry, "a", 1);
        registry.set_active(&stale.id, false).unwrap();

        let before = Utc::now() - chrono::Duration::seconds(60);
        assert_eq!(registry.remove_inactive(before), 0);

        let after = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(registry.remove_inactive(after), 1);
        assert!(registry.get(&stale.id).is_none());
        assert!(registry.get(&active.id).is_some());
        assert!(registry.group_counts().is_empty());
    }
}
