//! Live per-interest indices over the registry's holders.

use crate::interests::stream::{NotificationStream, SubscriptionId};
use crate::interests::Interest;
use crate::registry::MultiSourcedDataHolder;
use crate::types::{ChangeNotification, InstanceId, InstanceInfo};
use crossbeam_channel::Sender;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A subscriber attached to an index.
struct Subscriber {
    id: SubscriptionId,
    sender: Sender<ChangeNotification>,
    /// Sources whose open batch this subscriber has seen data from.
    open_batches: HashSet<u64>,
}

impl Subscriber {
    /// Returns false once the receiving side is gone.
    fn send(&mut self, notification: ChangeNotification, batch: Option<u64>) -> bool {
        if let Some(source_id) = batch {
            if !self.open_batches.contains(&source_id) {
                if self.open_batches.is_empty()
                    && self.sender.send(ChangeNotification::BufferStart).is_err()
                {
                    return false;
                }
                self.open_batches.insert(source_id);
            }
        }
        self.sender.send(notification).is_ok()
    }

    fn close_batch(&mut self, source_id: u64) -> bool {
        if self.open_batches.remove(&source_id) && self.open_batches.is_empty() {
            return self.sender.send(ChangeNotification::BufferEnd).is_ok();
        }
        true
    }
}

/// Members currently matching one interest plus everyone listening to it.
struct InterestIndex {
    interest: Interest,
    members: HashSet<InstanceId>,
    subscribers: Vec<Subscriber>,
}

impl InterestIndex {
    fn build(interest: Interest, holders: &HashMap<InstanceId, MultiSourcedDataHolder>) -> Self {
        let members = holders
            .iter()
            .filter(|(_, holder)| {
                holder.current_winner().is_some_and(|info| interest.matches(info))
            })
            .map(|(id, _)| id.clone())
            .collect();
        Self {
            interest,
            members,
            subscribers: Vec::new(),
        }
    }

    /// Notification implied by a new winner for `id`, updating membership.
    fn transition(
        &mut self,
        id: &InstanceId,
        winner: Option<&Arc<InstanceInfo>>,
    ) -> Option<ChangeNotification> {
        let was_member = self.members.contains(id);
        match winner {
            Some(info) if self.interest.matches(info) => {
                if was_member {
                    Some(ChangeNotification::Modify(Arc::clone(info)))
                } else {
                    self.members.insert(id.clone());
                    Some(ChangeNotification::Add(Arc::clone(info)))
                }
            }
            _ if was_member => {
                self.members.remove(id);
                Some(ChangeNotification::Delete(id.clone()))
            }
            _ => None,
        }
    }
}

/// Maps each subscribed interest to a live index.
///
/// Not synchronized: the owning registry serializes every call.
#[derive(Default)]
pub struct IndexRegistry {
    indexes: HashMap<Interest, InterestIndex>,
    subscriptions: HashMap<SubscriptionId, Interest>,
    next_id: u64,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe with a registry-assigned id.
    pub fn subscribe(
        &mut self,
        interest: Interest,
        holders: &HashMap<InstanceId, MultiSourcedDataHolder>,
    ) -> NotificationStream {
        self.next_id += 1;
        let (sender, stream) =
            NotificationStream::pair(SubscriptionId(self.next_id), interest.clone());
        self.attach(stream.id, interest, sender, holders);
        stream
    }

    /// Send the snapshot of `interest` to `sender`, then attach it to the
    /// live index. Both happen in this call, so no update can fall between
    /// them.
    pub fn attach(
        &mut self,
        id: SubscriptionId,
        interest: Interest,
        sender: Sender<ChangeNotification>,
        holders: &HashMap<InstanceId, MultiSourcedDataHolder>,
    ) -> bool {
        let index = self
            .indexes
            .entry(interest.clone())
            .or_insert_with(|| InterestIndex::build(interest.clone(), holders));

        let snapshot: Vec<Arc<InstanceInfo>> = index
            .members
            .iter()
            .filter_map(|member| holders.get(member).and_then(|h| h.current_winner()).cloned())
            .collect();

        if !snapshot.is_empty() {
            let delivered = std::iter::once(ChangeNotification::BufferStart)
                .chain(snapshot.into_iter().map(ChangeNotification::Add))
                .chain(std::iter::once(ChangeNotification::BufferEnd))
                .all(|notification| sender.send(notification).is_ok());
            if !delivered {
                if index.subscribers.is_empty() {
                    self.indexes.remove(&interest);
                }
                return false;
            }
        }

        index.subscribers.push(Subscriber {
            id,
            sender,
            open_batches: HashSet::new(),
        });
        self.subscriptions.insert(id, interest);
        true
    }

    /// Drop a subscription, completing its stream.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(interest) = self.subscriptions.remove(&id) else {
            return false;
        };
        if let Some(index) = self.indexes.get_mut(&interest) {
            index.subscribers.retain(|sub| sub.id != id);
            if index.subscribers.is_empty() {
                self.indexes.remove(&interest);
            }
        }
        true
    }

    /// Propagate a winner change of `id` to every index. `batch` names the
    /// source whose open batch the change belongs to.
    ///
    /// Returns the number of notifications delivered.
    pub fn on_change(
        &mut self,
        id: &InstanceId,
        winner: Option<&Arc<InstanceInfo>>,
        batch: Option<u64>,
    ) -> usize {
        let mut delivered = 0;
        let mut dropped = Vec::new();

        for index in self.indexes.values_mut() {
            let Some(notification) = index.transition(id, winner) else {
                continue;
            };
            for sub in index.subscribers.iter_mut() {
                if sub.send(notification.clone(), batch) {
                    delivered += 1;
                } else {
                    dropped.push(sub.id);
                }
            }
        }

        for sub_id in dropped {
            self.unsubscribe(sub_id);
        }
        delivered
    }

    /// A batch from `source_id` is over; close it for every subscriber that
    /// saw part of it.
    pub fn batch_closed(&mut self, source_id: u64) {
        let mut dropped = Vec::new();
        for index in self.indexes.values_mut() {
            for sub in index.subscribers.iter_mut() {
                if !sub.close_batch(source_id) {
                    dropped.push(sub.id);
                }
            }
        }
        for sub_id in dropped {
            self.unsubscribe(sub_id);
        }
    }

    /// Whether the winning copy of `holder` matches `interest`.
    pub fn matches(&self, interest: &Interest, holder: &MultiSourcedDataHolder) -> bool {
        holder.current_winner().is_some_and(|info| interest.matches(info))
    }

    /// Complete every stream.
    pub fn close_all(&mut self) {
        self.indexes.clear();
        self.subscriptions.clear();
    }

    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.subscriptions.contains_key(&id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn index_count(&self) -> usize {
        self.indexes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SourcePriority;
    use crate::types::{InstanceStatus, Origin, Source};

    struct Fixture {
        holders: HashMap<InstanceId, MultiSourcedDataHolder>,
        index: IndexRegistry,
        source: Source,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                holders: HashMap::new(),
                index: IndexRegistry::new(),
                source: Source::new(Origin::Interested, "test"),
            }
        }

        fn put(&mut self, info: InstanceInfo, batch: Option<u64>) {
            let id = info.id.clone();
            let holder = self
                .holders
                .entry(id.clone())
                .or_insert_with(|| {
                    MultiSourcedDataHolder::new(id.clone(), SourcePriority::default())
                });
            let change = holder.update(&self.source, Arc::new(info));
            self.index.on_change(&id, change.current.as_ref(), batch);
        }

        fn delete(&mut self, id: &str) {
            let id = InstanceId::from(id);
            if let Some(holder) = self.holders.get_mut(&id) {
                holder.remove(&self.source);
                self.holders.remove(&id);
            }
            self.index.on_change(&id, None, None);
        }
    }

    fn adds(notifications: &[ChangeNotification]) -> Vec<String> {
        let mut ids: Vec<String> = notifications
            .iter()
            .filter_map(|n| match n {
                ChangeNotification::Add(info) => Some(info.id.0.clone()),
                _ => None,
            })
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_snapshot_then_live() {
        let mut fx = Fixture::new();
        fx.put(InstanceInfo::new("d-1", "discovery"), None);
        fx.put(InstanceInfo::new("d-2", "discovery"), None);
        fx.put(InstanceInfo::new("z-1", "zuul"), None);

        let stream = fx.index.subscribe(Interest::application("discovery"), &fx.holders);
        let snapshot = stream.drain();
        assert_eq!(snapshot.first(), Some(&ChangeNotification::BufferStart));
        assert_eq!(snapshot.last(), Some(&ChangeNotification::BufferEnd));
        assert_eq!(adds(&snapshot), vec!["d-1", "d-2"]);

        fx.put(InstanceInfo::new("d-3", "discovery"), None);
        fx.put(InstanceInfo::new("z-2", "zuul"), None);
        assert_eq!(adds(&stream.drain()), vec!["d-3"]);
    }

    #[test]
    fn test_empty_snapshot_has_no_markers() {
        let mut fx = Fixture::new();
        let stream = fx.index.subscribe(Interest::application("discovery"), &fx.holders);
        assert!(stream.drain().is_empty());
    }

    #[test]
    fn test_modify_and_delete() {
        let mut fx = Fixture::new();
        let stream = fx.index.subscribe(Interest::application("discovery"), &fx.holders);

        fx.put(InstanceInfo::new("d-1", "discovery"), None);
        fx.put(InstanceInfo::new("d-1", "discovery").with_status(InstanceStatus::Down), None);
        fx.delete("d-1");

        let events = stream.drain();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ChangeNotification::Add(_)));
        assert!(matches!(
            &events[1],
            ChangeNotification::Modify(info) if info.status == InstanceStatus::Down
        ));
        assert_eq!(events[2], ChangeNotification::Delete(InstanceId::from("d-1")));
    }

    #[test]
    fn test_leaving_interest_emits_delete() {
        let mut fx = Fixture::new();
        let stream = fx.index.subscribe(Interest::vip("edge.vip"), &fx.holders);

        fx.put(InstanceInfo::new("i-1", "zuul").with_vip_address("edge.vip"), None);
        fx.put(InstanceInfo::new("i-1", "zuul").with_vip_address("other.vip"), None);

        let events = stream.drain();
        assert!(matches!(&events[0], ChangeNotification::Add(_)));
        assert_eq!(events[1], ChangeNotification::Delete(InstanceId::from("i-1")));
    }

    #[test]
    fn test_composite_dedupes_by_instance() {
        let mut fx = Fixture::new();
        let interest = Interest::application("zuul").union(&Interest::application_group("edge"));
        let stream = fx.index.subscribe(interest, &fx.holders);

        // Matches both members, must appear once.
        fx.put(InstanceInfo::new("z-1", "zuul").with_app_group("edge"), None);
        assert_eq!(stream.drain().len(), 1);
    }

    #[test]
    fn test_shared_index_per_interest() {
        let mut fx = Fixture::new();
        let first = fx.index.subscribe(Interest::application("discovery"), &fx.holders);
        let second = fx.index.subscribe(Interest::application("discovery"), &fx.holders);
        let other = fx.index.subscribe(Interest::FullRegistry, &fx.holders);

        assert_eq!(fx.index.index_count(), 2);
        assert_eq!(fx.index.subscription_count(), 3);

        fx.put(InstanceInfo::new("d-1", "discovery"), None);
        assert_eq!(first.drain().len(), 1);
        assert_eq!(second.drain().len(), 1);
        assert_eq!(other.drain().len(), 1);
    }

    #[test]
    fn test_unsubscribe_completes_only_that_stream() {
        let mut fx = Fixture::new();
        let first = fx.index.subscribe(Interest::application("discovery"), &fx.holders);
        let second = fx.index.subscribe(Interest::application("discovery"), &fx.holders);

        assert!(fx.index.unsubscribe(first.id));
        assert!(!fx.index.unsubscribe(first.id));
        assert!(first.is_completed());

        fx.put(InstanceInfo::new("d-1", "discovery"), None);
        assert_eq!(second.drain().len(), 1);
        assert_eq!(fx.index.index_count(), 1);
    }

    #[test]
    fn test_dropped_stream_is_pruned() {
        let mut fx = Fixture::new();
        let stream = fx.index.subscribe(Interest::application("discovery"), &fx.holders);
        drop(stream);

        fx.put(InstanceInfo::new("d-1", "discovery"), None);
        assert_eq!(fx.index.subscription_count(), 0);
        assert_eq!(fx.index.index_count(), 0);
    }

    #[test]
    fn test_batch_markers_bracket_live_data() {
        let mut fx = Fixture::new();
        let stream = fx.index.subscribe(Interest::FullRegistry, &fx.holders);
        let batch = Some(fx.source.id);

        fx.put(InstanceInfo::new("a", "app"), batch);
        fx.put(InstanceInfo::new("b", "app"), batch);
        fx.index.batch_closed(fx.source.id);

        let events = stream.drain();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], ChangeNotification::BufferStart);
        assert_eq!(events[3], ChangeNotification::BufferEnd);
    }

    #[test]
    fn test_batch_close_skips_uninvolved_subscribers() {
        let mut fx = Fixture::new();
        let zuul = fx.index.subscribe(Interest::application("zuul"), &fx.holders);

        fx.put(InstanceInfo::new("d-1", "discovery"), Some(fx.source.id));
        fx.index.batch_closed(fx.source.id);

        assert!(zuul.drain().is_empty());
    }

    #[test]
    fn test_close_all_completes_streams() {
        let mut fx = Fixture::new();
        let stream = fx.index.subscribe(Interest::FullRegistry, &fx.holders);
        fx.index.close_all();
        assert!(stream.is_completed());
    }

    #[test]
    fn test_matches_holder() {
        let mut fx = Fixture::new();
        fx.put(InstanceInfo::new("d-1", "discovery"), None);
        let holder = &fx.holders[&InstanceId::from("d-1")];

        assert!(fx.index.matches(&Interest::application("discovery"), holder));
        assert!(!fx.index.matches(&Interest::application("zuul"), holder));
    }
}
