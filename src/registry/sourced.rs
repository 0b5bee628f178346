//! The registry aggregate: holders, interest indices and batching.

use crate::completion::Completion;
use crate::config::RegistryConfig;
use crate::error::{InterestError, Result};
use crate::interests::{
    BatchTransition, BatchingRegistry, IndexRegistry, Interest, NotificationStream, Quiescence,
    SubscriptionId,
};
use crate::metrics::{Counter, Gauge, MetricsSink, NoopMetrics};
use crate::registry::holder::{HolderChange, MultiSourcedDataHolder, SourcePriority};
use crate::scheduler::Scheduler;
use crate::types::{ChangeNotification, InstanceId, InstanceInfo, Source};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// State mutated only by tasks running on the registry's scheduler.
struct RegistryState {
    holders: HashMap<InstanceId, MultiSourcedDataHolder>,
    index: IndexRegistry,
    batching: BatchingRegistry,
    /// Subscriptions created but not yet attached by their snapshot task.
    pending: HashMap<SubscriptionId, Sender<ChangeNotification>>,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    scheduler: Arc<dyn Scheduler>,
    metrics: Arc<dyn MetricsSink>,
    priority: SourcePriority,
    closed: AtomicBool,
    next_subscription: AtomicU64,
}

/// Registry of instances holding one copy per source.
///
/// Every mutation is queued on the scheduler and applied by a single task,
/// so holder updates, index updates and notification delivery are atomic
/// with respect to each other. Operations return a [`Completion`] that
/// resolves when the task has run.
#[derive(Clone)]
pub struct SourcedEurekaRegistry {
    inner: Arc<RegistryInner>,
}

impl SourcedEurekaRegistry {
    pub fn new(config: &RegistryConfig, scheduler: Arc<dyn Scheduler>) -> Result<Self> {
        Self::with_metrics(config, scheduler, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        config: &RegistryConfig,
        scheduler: Arc<dyn Scheduler>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let priority = config.priority()?;
        Ok(Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState {
                    holders: HashMap::new(),
                    index: IndexRegistry::new(),
                    batching: BatchingRegistry::new(config.batch_quiescence()),
                    pending: HashMap::new(),
                }),
                scheduler,
                metrics,
                priority,
                closed: AtomicBool::new(false),
                next_subscription: AtomicU64::new(1),
            }),
        })
    }

    /// The execution context all registry tasks run on.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.inner.scheduler
    }

    /// Upsert the copy of `info` owned by `source`.
    ///
    /// Resolves to true if this created the instance's holder.
    pub fn register(
        &self,
        info: impl Into<Arc<InstanceInfo>>,
        source: &Source,
    ) -> Completion<bool> {
        let info = info.into();
        let source = source.clone();
        self.submit(move |inner, state| Ok(inner.register(state, info, &source)))
    }

    /// Remove the copy of `id` owned by `source`.
    ///
    /// Resolves to true if a copy was removed.
    pub fn unregister(&self, id: &InstanceId, source: &Source) -> Completion<bool> {
        let id = id.clone();
        let source = source.clone();
        self.submit(move |inner, state| Ok(inner.unregister(state, &id, &source)))
    }

    /// Remove every copy owned by `source` in one pass.
    ///
    /// Resolves to the number of copies removed.
    pub fn evict_all(&self, source: &Source) -> Completion<usize> {
        let source = source.clone();
        self.submit(move |inner, state| Ok(inner.evict_all(state, &source)))
    }

    /// Open a batch for `source` that stays open until [`end_batch`](Self::end_batch).
    pub fn begin_batch(&self, source: &Source) -> Completion<()> {
        let source_id = source.id;
        self.submit(move |inner, state| {
            let now = inner.scheduler.now();
            if state.batching.open_explicit(source_id, now) {
                inner.metrics.increment(Counter::BatchStarted, 1);
            }
            Ok(())
        })
    }

    pub fn end_batch(&self, source: &Source) -> Completion<()> {
        let source_id = source.id;
        self.submit(move |inner, state| {
            if state.batching.close_explicit(source_id) {
                state.index.batch_closed(source_id);
                inner.metrics.increment(Counter::BatchCompleted, 1);
            }
            Ok(())
        })
    }

    /// Stream of changes for `interest`: first one `Add` per instance that
    /// currently matches, then live changes.
    ///
    /// The snapshot is taken by a scheduler task, so the stream stays empty
    /// until that task runs.
    pub fn for_interest(&self, interest: &Interest) -> Result<NotificationStream> {
        if self.is_shut_down() {
            return Err(InterestError::RegistryClosed);
        }
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (sender, stream) = NotificationStream::pair(id, interest.clone());
        self.inner.state.lock().pending.insert(id, sender);

        let interest = interest.clone();
        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.execute(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.attach(id, interest);
            }
        }));
        Ok(stream)
    }

    /// Cancel a subscription and complete its stream. Other subscriptions
    /// are unaffected.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.inner.state.lock();
        let removed = state.pending.remove(&id).is_some() || state.index.unsubscribe(id);
        self.inner.report_subscriptions(&state);
        removed
    }

    pub fn has_subscription(&self, id: SubscriptionId) -> bool {
        let state = self.inner.state.lock();
        state.pending.contains_key(&id) || state.index.is_subscribed(id)
    }

    /// Snapshot of every holder.
    pub fn holders(&self) -> Completion<Vec<MultiSourcedDataHolder>> {
        self.submit(|_, state| Ok(state.holders.values().cloned().collect()))
    }

    /// Number of instances currently held.
    pub fn size(&self) -> usize {
        self.inner.state.lock().holders.len()
    }

    /// Stop accepting operations and complete every stream.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.inner.state.lock();
        state.pending.clear();
        state.index.close_all();
        tracing::info!(instances = state.holders.len(), "Registry shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Queue `op` on the scheduler. Fails fast once shut down, and again
    /// inside the task if shutdown began after queueing.
    fn submit<T, F>(&self, op: F) -> Completion<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&Arc<RegistryInner>, &mut RegistryState) -> Result<T> + Send + 'static,
    {
        if self.is_shut_down() {
            return Completion::failed(InterestError::RegistryClosed);
        }
        let completion = Completion::new();
        let result = completion.clone();
        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.execute(Box::new(move || {
            let outcome = match weak.upgrade() {
                Some(inner) if !inner.closed.load(Ordering::SeqCst) => {
                    let mut state = inner.state.lock();
                    op(&inner, &mut *state)
                }
                _ => Err(InterestError::RegistryClosed),
            };
            result.complete(outcome);
        }));
        completion
    }
}

impl RegistryInner {
    fn register(
        self: &Arc<Self>,
        state: &mut RegistryState,
        info: Arc<InstanceInfo>,
        source: &Source,
    ) -> bool {
        let id = info.id.clone();
        let priority = self.priority;
        let created = !state.holders.contains_key(&id);
        let change = state
            .holders
            .entry(id.clone())
            .or_insert_with(|| MultiSourcedDataHolder::new(id.clone(), priority))
            .update(source, info);

        self.metrics.increment(Counter::Registration, 1);
        self.emit(state, &id, &change, source);
        if created {
            self.metrics.gauge(Gauge::RegistrySize, state.holders.len() as u64);
        }
        created
    }

    fn unregister(
        self: &Arc<Self>,
        state: &mut RegistryState,
        id: &InstanceId,
        source: &Source,
    ) -> bool {
        let Some(holder) = state.holders.get_mut(id) else {
            return false;
        };
        let change = holder.remove(source);
        if holder.is_empty() {
            state.holders.remove(id);
            self.metrics.gauge(Gauge::RegistrySize, state.holders.len() as u64);
        }

        self.metrics.increment(Counter::Unregistration, 1);
        self.emit(state, id, &change, source);
        change.removed.is_some()
    }

    fn evict_all(self: &Arc<Self>, state: &mut RegistryState, source: &Source) -> usize {
        let owned: Vec<InstanceId> = state
            .holders
            .iter()
            .filter(|(_, holder)| holder.get(source).is_some())
            .map(|(id, _)| id.clone())
            .collect();

        for id in &owned {
            if let Some(holder) = state.holders.get_mut(id) {
                let change = holder.remove(source);
                if holder.is_empty() {
                    state.holders.remove(id);
                }
                self.emit(state, id, &change, source);
            }
        }

        if !owned.is_empty() {
            tracing::debug!(source = %source, evicted = owned.len(), "Evicted source data");
            self.metrics.increment(Counter::Eviction, owned.len() as u64);
            self.metrics.gauge(Gauge::RegistrySize, state.holders.len() as u64);
        }

        // An evicted source sends nothing more, so its batch ends here.
        if state.batching.close_explicit(source.id) {
            state.index.batch_closed(source.id);
            self.metrics.increment(Counter::BatchCompleted, 1);
        }
        owned.len()
    }

    /// Forward a holder transition to the indices, inside the source's batch.
    fn emit(
        self: &Arc<Self>,
        state: &mut RegistryState,
        id: &InstanceId,
        change: &HolderChange,
        source: &Source,
    ) {
        if !change.winner_changed() {
            return;
        }
        let batch = match state.batching.on_notification(source.id, self.scheduler.now()) {
            BatchTransition::Opened => {
                self.metrics.increment(Counter::BatchStarted, 1);
                self.schedule_quiescence_check(source.id, state.batching.window());
                Some(source.id)
            }
            BatchTransition::Extended => Some(source.id),
            BatchTransition::Disabled => None,
        };
        state.index.on_change(id, change.current.as_ref(), batch);
    }

    fn schedule_quiescence_check(self: &Arc<Self>, source_id: u64, delay: std::time::Duration) {
        let weak: Weak<RegistryInner> = Arc::downgrade(self);
        self.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.check_quiescence(source_id);
                }
            }),
        );
    }

    fn check_quiescence(self: &Arc<Self>, source_id: u64) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock();
        match state.batching.check_quiescence(source_id, self.scheduler.now()) {
            Quiescence::Closed => {
                state.index.batch_closed(source_id);
                self.metrics.increment(Counter::BatchCompleted, 1);
            }
            Quiescence::Recheck(delay) => self.schedule_quiescence_check(source_id, delay),
            Quiescence::Idle => {}
        }
    }

    fn attach(self: &Arc<Self>, id: SubscriptionId, interest: Interest) {
        let mut state = self.state.lock();
        // Cancelled or shut down before the snapshot task ran.
        let Some(sender) = state.pending.remove(&id) else {
            return;
        };
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let RegistryState { holders, index, .. } = &mut *state;
        index.attach(id, interest, sender, holders);
        self.report_subscriptions(&state);
    }

    fn report_subscriptions(&self, state: &RegistryState) {
        self.metrics.gauge(Gauge::Subscribers, state.index.subscription_count() as u64);
        self.metrics.gauge(Gauge::InterestIndexes, state.index.index_count() as u64);
    }
}
