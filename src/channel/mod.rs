//! Remote subscription channels.

mod factory;
mod interest_channel;

pub use factory::{ChannelFactory, InterestChannelFactory};
pub use interest_channel::{ChannelState, InterestChannel};

use crate::metrics::MetricsSink;
use crate::registry::SourcedEurekaRegistry;
use crate::scheduler::Scheduler;
use crate::transport::TransportClient;
use std::sync::Arc;

/// Collaborators shared by every channel of a client.
#[derive(Clone)]
pub struct ChannelContext {
    pub registry: SourcedEurekaRegistry,
    pub transport: Arc<dyn TransportClient>,
    pub scheduler: Arc<dyn Scheduler>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl ChannelContext {
    /// Context running on the registry's scheduler.
    pub fn new(
        registry: SourcedEurekaRegistry,
        transport: Arc<dyn TransportClient>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let scheduler = Arc::clone(registry.scheduler());
        Self {
            registry,
            transport,
            scheduler,
            metrics,
        }
    }
}
