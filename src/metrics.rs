//! Metrics sink consumed by the registry, channels and client.
//!
//! Emission is fire-and-forget: sinks never fail and never influence control
//! flow.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Monotonic counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Counter {
    ChannelCreated,
    ChannelFailed,
    InterestChangeSent,
    InterestChangeFailed,
    Registration,
    Unregistration,
    Eviction,
    BatchStarted,
    BatchCompleted,
    Retry,
}

/// Point-in-time values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Gauge {
    ActiveChannels,
    RegistrySize,
    InterestIndexes,
    Subscribers,
}

pub trait MetricsSink: Send + Sync {
    fn increment(&self, counter: Counter, delta: u64);
    fn gauge(&self, gauge: Gauge, value: u64);
}

/// Sink that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _counter: Counter, _delta: u64) {}
    fn gauge(&self, _gauge: Gauge, _value: u64) {}
}

/// Sink that keeps the latest values in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<Counter, u64>>,
    gauges: Mutex<HashMap<Gauge, u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters.lock().get(&counter).copied().unwrap_or(0)
    }

    pub fn gauge_value(&self, gauge: Gauge) -> Option<u64> {
        self.gauges.lock().get(&gauge).copied()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, counter: Counter, delta: u64) {
        *self.counters.lock().entry(counter).or_insert(0) += delta;
    }

    fn gauge(&self, gauge: Gauge, value: u64) {
        self.gauges.lock().insert(gauge, value);
    }
}
