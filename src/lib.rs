//! # Eureka Interest Client
//!
//! Client-side subscription engine for a service-discovery registry.
//!
//! ## Core Concepts
//!
//! - **Registry**: Local cache of instances, one copy per [`Source`]; the
//!   highest-priority copy wins and is what subscribers see
//! - **Interests**: Declarative queries (application, group, vip, instance,
//!   full registry) and their unions
//! - **Streams**: Per-subscriber notification streams, snapshot first and
//!   then live changes
//! - **Channel**: One remote subscription session carrying the union of all
//!   local interests, replaced after failure
//!
//! ## Example
//!
//! ```ignore
//! use eureka_interest::{
//!     ClientConfig, EurekaInterestClient, Interest, SourcedEurekaRegistry, ThreadScheduler,
//! };
//!
//! let config = ClientConfig::default();
//! let scheduler = Arc::new(ThreadScheduler::start("eureka-client")?);
//! let registry = SourcedEurekaRegistry::new(&config.registry, scheduler)?;
//! let metrics = Arc::new(NoopMetrics);
//! let client = EurekaInterestClient::with_transport(registry, transport, &config, metrics)?;
//!
//! let stream = client.for_interest(Interest::application("discovery"))?;
//! while let Ok(notification) = stream.recv() {
//!     println!("{notification:?}");
//! }
//! ```

pub mod channel;
pub mod client;
pub mod completion;
pub mod config;
pub mod error;
pub mod interests;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod transport;
pub mod types;

// Re-exports
pub use channel::{
    ChannelContext, ChannelFactory, ChannelState, InterestChannel, InterestChannelFactory,
};
pub use client::EurekaInterestClient;
pub use completion::Completion;
pub use config::{ClientConfig, RegistryConfig};
pub use error::{InterestError, Result};
pub use interests::{Interest, NotificationStream, SubscriptionId};
pub use metrics::{Counter, Gauge, InMemoryMetrics, MetricsSink, NoopMetrics};
pub use registry::{MultiSourcedDataHolder, SourcePriority, SourcedEurekaRegistry};
pub use scheduler::{Scheduler, TestScheduler, ThreadScheduler, TimerId};
pub use transport::{
    ClientMessage, MessageConnection, MessageHandler, ServerMessage, StreamState, TransportClient,
};
pub use types::{ChangeNotification, InstanceId, InstanceInfo, InstanceStatus, Origin, Source};
