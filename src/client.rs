//! Interest client: one shared channel serving every local subscription.
//!
//! Each call to [`EurekaInterestClient::for_interest`] folds the requested
//! interest into a growing union. Whenever the union grows, the whole union
//! is pushed upstream on the current channel. Subscribers read from the
//! local registry, so they never see the channel directly and are not
//! affected when it fails and is replaced.

use crate::channel::{ChannelContext, ChannelFactory, InterestChannel, InterestChannelFactory};
use crate::config::ClientConfig;
use crate::error::{InterestError, Result};
use crate::interests::{Interest, NotificationStream, SubscriptionId};
use crate::metrics::{Counter, Gauge, MetricsSink, NoopMetrics};
use crate::registry::SourcedEurekaRegistry;
use crate::scheduler::TimerId;
use crate::transport::TransportClient;
use crate::types::Source;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

struct ClientState {
    /// Union of every interest requested so far. Never shrinks.
    union: Interest,
    channel: Option<InterestChannel>,
    /// Number of channels opened so far.
    generation: u64,
    retry_timer: Option<TimerId>,
    subscriptions: Vec<SubscriptionId>,
    /// Sources of failed channels whose data is kept until the
    /// replacement channel is acknowledged.
    stale_sources: Vec<Source>,
    shut_down: bool,
}

struct ClientInner {
    registry: SourcedEurekaRegistry,
    factory: Arc<dyn ChannelFactory>,
    metrics: Arc<dyn MetricsSink>,
    retry_wait: Duration,
    evict_on_channel_failure: bool,
    state: Mutex<ClientState>,
}

/// Client-side entry point for interest subscriptions.
#[derive(Clone)]
pub struct EurekaInterestClient {
    inner: Arc<ClientInner>,
}

impl EurekaInterestClient {
    pub fn new(
        registry: SourcedEurekaRegistry,
        factory: Arc<dyn ChannelFactory>,
        config: &ClientConfig,
    ) -> Result<Self> {
        Self::with_metrics(registry, factory, config, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        registry: SourcedEurekaRegistry,
        factory: Arc<dyn ChannelFactory>,
        config: &ClientConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                registry,
                factory,
                metrics,
                retry_wait: config.retry_wait(),
                evict_on_channel_failure: config.evict_on_channel_failure,
                state: Mutex::new(ClientState {
                    union: Interest::empty(),
                    channel: None,
                    generation: 0,
                    retry_timer: None,
                    subscriptions: Vec::new(),
                    stale_sources: Vec::new(),
                    shut_down: false,
                }),
            }),
        })
    }

    /// Client whose channels run over `transport`, sharing `registry`'s
    /// scheduler.
    pub fn with_transport(
        registry: SourcedEurekaRegistry,
        transport: Arc<dyn TransportClient>,
        config: &ClientConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let context = ChannelContext::new(registry.clone(), transport, Arc::clone(&metrics));
        let factory = Arc::new(InterestChannelFactory::new(context, config));
        Self::with_metrics(registry, factory, config, metrics)
    }

    pub fn registry(&self) -> &SourcedEurekaRegistry {
        &self.inner.registry
    }

    /// Subscribe to `interest`.
    ///
    /// The returned stream first replays every matching instance already
    /// held locally, then follows live changes. If `interest` is not yet
    /// covered by the union, the grown union is sent upstream.
    pub fn for_interest(&self, interest: Interest) -> Result<NotificationStream> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.shut_down {
            return Err(InterestError::ClientClosed);
        }

        let stream = inner.registry.for_interest(&interest)?;
        let registry = &inner.registry;
        state.subscriptions.retain(|id| registry.has_subscription(*id));
        state.subscriptions.push(stream.id);

        let union = state.union.union(&interest);
        if union == state.union {
            return Ok(stream);
        }
        tracing::debug!(interest = %interest, union = %union, "Interest union grew");
        state.union = union.clone();

        let current = state.channel.clone();
        match current {
            Some(channel) => {
                drop(state);
                inner.send_change(&channel, union);
            }
            // The pending retry replays the union on the replacement.
            None if state.retry_timer.is_some() => {}
            None => {
                let channel = inner.open_channel(&mut state);
                drop(state);
                inner.send_change(&channel, union);
            }
        }
        Ok(stream)
    }

    /// Cancel one subscription and complete its stream. The union and the
    /// channel are left as they are.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.state.lock().subscriptions.retain(|tracked| *tracked != id);
        self.inner.registry.unsubscribe(id)
    }

    /// Number of subscriptions this client is tracking.
    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    /// Union of every interest requested so far.
    pub fn current_interest(&self) -> Interest {
        self.inner.state.lock().union.clone()
    }

    /// Number of channels opened so far; grows by one per replacement.
    pub fn channel_generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    pub fn current_channel(&self) -> Option<InterestChannel> {
        self.inner.state.lock().channel.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shut_down
    }

    /// Close the channel, evict its data and complete every stream returned
    /// by [`for_interest`](Self::for_interest). Idempotent.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let (channel, timer, subscriptions, stale) = {
            let mut state = inner.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            (
                state.channel.take(),
                state.retry_timer.take(),
                std::mem::take(&mut state.subscriptions),
                std::mem::take(&mut state.stale_sources),
            )
        };

        if let Some(timer) = timer {
            inner.registry.scheduler().cancel(timer);
        }
        for id in subscriptions {
            inner.registry.unsubscribe(id);
        }

        let mut evict: Vec<Source> = stale;
        if let Some(channel) = channel {
            channel.close();
            if !inner.evict_on_channel_failure {
                evict.push(channel.source().clone());
            }
        }
        for source in &evict {
            inner.evict(source);
        }

        inner.metrics.gauge(Gauge::ActiveChannels, 0);
        tracing::info!("Interest client shut down");
    }
}

impl ClientInner {
    /// Create the next channel and watch its lifecycle. Caller holds the
    /// state lock.
    fn open_channel(self: &Arc<Self>, state: &mut ClientState) -> InterestChannel {
        let channel = self.factory.new_channel();
        state.generation += 1;
        state.channel = Some(channel.clone());
        self.metrics.increment(Counter::ChannelCreated, 1);
        self.metrics.gauge(Gauge::ActiveChannels, 1);
        tracing::debug!(
            channel = channel.id(),
            generation = state.generation,
            "Opened interest channel"
        );

        let weak: Weak<ClientInner> = Arc::downgrade(self);
        let channel_id = channel.id();
        channel.lifecycle().on_complete(move |result| {
            if let Some(inner) = weak.upgrade() {
                inner.on_channel_closed(channel_id, result);
            }
        });
        channel
    }

    fn send_change(self: &Arc<Self>, channel: &InterestChannel, interest: Interest) {
        let weak = Arc::downgrade(self);
        let channel_id = channel.id();
        channel.change(interest).on_complete(move |result| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(()) => inner.on_change_acknowledged(channel_id),
                // The channel closes itself; its lifecycle drives the retry.
                Err(e) => {
                    tracing::debug!(channel = channel_id, error = %e, "Interest change failed")
                }
            }
        });
    }

    /// Evict data left behind by failed channels once a live one has
    /// taken over.
    fn on_change_acknowledged(&self, channel_id: u64) {
        let stale = {
            let mut state = self.state.lock();
            let current = state.channel.as_ref().map(InterestChannel::id);
            if state.shut_down || current != Some(channel_id) {
                return;
            }
            std::mem::take(&mut state.stale_sources)
        };
        for source in &stale {
            self.evict(source);
        }
    }

    fn on_channel_closed(self: &Arc<Self>, channel_id: u64, result: Result<()>) {
        let mut state = self.state.lock();
        let current = state.channel.as_ref().map(InterestChannel::id);
        if state.shut_down || current != Some(channel_id) {
            return;
        }
        let Some(channel) = state.channel.take() else {
            return;
        };
        self.metrics.gauge(Gauge::ActiveChannels, 0);
        if !self.evict_on_channel_failure {
            state.stale_sources.push(channel.source().clone());
        }

        match result {
            Err(e) if e.is_recoverable() => tracing::warn!(
                channel = channel_id,
                error = %e,
                retry_ms = self.retry_wait.as_millis() as u64,
                "Interest channel lost, scheduling replacement"
            ),
            Err(e) => tracing::error!(
                channel = channel_id,
                error = %e,
                "Interest channel failed, scheduling replacement"
            ),
            Ok(()) => tracing::info!(
                channel = channel_id,
                "Interest channel closed, scheduling replacement"
            ),
        }

        let weak = Arc::downgrade(self);
        let timer = self.registry.scheduler().schedule(
            self.retry_wait,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.retry();
                }
            }),
        );
        state.retry_timer = Some(timer);
    }

    fn retry(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.retry_timer = None;
        if state.shut_down || state.channel.is_some() {
            return;
        }
        self.metrics.increment(Counter::Retry, 1);
        let union = state.union.clone();
        let channel = self.open_channel(&mut state);
        drop(state);

        tracing::info!(
            channel = channel.id(),
            union = %union,
            "Replaying interest on replacement channel"
        );
        self.send_change(&channel, union);
    }

    fn evict(&self, source: &Source) {
        let label = source.clone();
        self.registry.evict_all(source).on_complete(move |result| match result {
            Ok(count) => tracing::debug!(source = %label, evicted = count, "Evicted channel data"),
            Err(e) => tracing::debug!(source = %label, error = %e, "Eviction skipped"),
        });
    }
}
