//! Per-instance store holding one copy per data source.

use crate::error::{InterestError, Result};
use crate::types::{InstanceId, InstanceInfo, Origin, Source};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

/// Total order over origins used to pick the winning copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourcePriority {
    order: [Origin; 3],
}

impl SourcePriority {
    /// `order` lists origins from highest to lowest priority and must
    /// contain each origin exactly once.
    pub fn new(order: &[Origin]) -> Result<Self> {
        let complete = order.len() == Origin::ALL.len()
            && Origin::ALL.iter().all(|origin| order.contains(origin));
        if !complete {
            return Err(InterestError::Config(format!(
                "source priority must list each of {:?} exactly once, got {:?}",
                Origin::ALL,
                order
            )));
        }
        Ok(Self {
            order: [order[0], order[1], order[2]],
        })
    }

    /// Position of `origin` in the order; lower wins.
    pub fn rank(&self, origin: Origin) -> usize {
        self.order
            .iter()
            .position(|o| *o == origin)
            .unwrap_or(self.order.len())
    }
}

impl Default for SourcePriority {
    fn default() -> Self {
        Self {
            order: [Origin::Replicated, Origin::Interested, Origin::Local],
        }
    }
}

#[derive(Clone, Debug)]
struct SourcedCopy {
    info: Arc<InstanceInfo>,
    /// Holder-local write counter, used to break ties between equal origins.
    written: u64,
}

/// Winner before and after a holder mutation.
#[derive(Clone, Debug, Default)]
pub struct HolderChange {
    pub previous: Option<Arc<InstanceInfo>>,
    pub current: Option<Arc<InstanceInfo>>,
    /// Copy removed by `remove`, if the source had one.
    pub removed: Option<Arc<InstanceInfo>>,
}

impl HolderChange {
    /// True if subscribers must be told: the winning value appeared,
    /// disappeared, or differs from the previous winner.
    pub fn winner_changed(&self) -> bool {
        match (&self.previous, &self.current) {
            (None, None) => false,
            (Some(before), Some(after)) => !Arc::ptr_eq(before, after) && before != after,
            _ => true,
        }
    }
}

/// All known copies of one instance, keyed by source.
///
/// Invariant: at most one copy per source. The owning registry deletes the
/// holder as soon as its last copy is removed.
#[derive(Clone, Debug)]
pub struct MultiSourcedDataHolder {
    id: InstanceId,
    priority: SourcePriority,
    copies: HashMap<Source, SourcedCopy>,
    next_write: u64,
}

impl MultiSourcedDataHolder {
    pub fn new(id: InstanceId, priority: SourcePriority) -> Self {
        Self {
            id,
            priority,
            copies: HashMap::new(),
            next_write: 0,
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    /// Insert or replace the copy owned by `source`.
    pub fn update(&mut self, source: &Source, info: Arc<InstanceInfo>) -> HolderChange {
        let previous = self.current_winner().cloned();
        self.next_write += 1;
        self.copies.insert(
            source.clone(),
            SourcedCopy {
                info,
                written: self.next_write,
            },
        );
        HolderChange {
            previous,
            current: self.current_winner().cloned(),
            removed: None,
        }
    }

    /// Remove the copy owned by `source`.
    pub fn remove(&mut self, source: &Source) -> HolderChange {
        let previous = self.current_winner().cloned();
        let removed = self.copies.remove(source).map(|copy| copy.info);
        HolderChange {
            previous,
            current: self.current_winner().cloned(),
            removed,
        }
    }

    pub fn get(&self, source: &Source) -> Option<&Arc<InstanceInfo>> {
        self.copies.get(source).map(|copy| &copy.info)
    }

    pub fn current_winner(&self) -> Option<&Arc<InstanceInfo>> {
        self.winner().map(|(_, copy)| &copy.info)
    }

    pub fn winning_source(&self) -> Option<&Source> {
        self.winner().map(|(source, _)| source)
    }

    pub fn all_sources(&self) -> Vec<&Source> {
        self.copies.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.copies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    fn winner(&self) -> Option<(&Source, &SourcedCopy)> {
        self.copies
            .iter()
            .min_by_key(|(source, copy)| (self.priority.rank(source.origin), Reverse(copy.written)))
    }
}
