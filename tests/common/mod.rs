//! Shared fixtures: an in-process transport whose connections follow a
//! script, plus registry and client builders on a virtual clock.

#![allow(dead_code)]

use eureka_interest::{
    ChangeNotification, ClientConfig, ClientMessage, Completion, EurekaInterestClient,
    InMemoryMetrics, InstanceId, InstanceInfo, InterestError, MessageConnection, MessageHandler,
    RegistryConfig, Scheduler, ServerMessage, SourcedEurekaRegistry, StreamState, TestScheduler,
    TransportClient,
};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How one connection behaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    /// Acknowledge every change and deliver matching catalog instances.
    Healthy,
    /// Fail the connect attempt.
    RefuseConnect,
    /// Connect, then reject every interest change.
    RejectChanges,
    /// Deliver this many instances, then drop the connection.
    DeliverThenFail(usize),
}

pub struct ScriptedConnection {
    behavior: Behavior,
    /// Bracket each delivery with `BufferStart`/`BufferEnd`.
    markers: bool,
    catalog: Vec<InstanceInfo>,
    handler: Mutex<Option<MessageHandler>>,
    delivered: Mutex<HashSet<InstanceId>>,
    messages: Mutex<Vec<ClientMessage>>,
    lifecycle: Completion<()>,
}

impl ScriptedConnection {
    fn new(behavior: Behavior, markers: bool, catalog: Vec<InstanceInfo>) -> Self {
        Self {
            behavior,
            markers,
            catalog,
            handler: Mutex::new(None),
            delivered: Mutex::new(HashSet::new()),
            messages: Mutex::new(Vec::new()),
            lifecycle: Completion::new(),
        }
    }

    /// Messages the client sent on this connection, in order.
    pub fn messages(&self) -> Vec<ClientMessage> {
        self.messages.lock().clone()
    }

    /// Push a message from the server side.
    pub fn push(&self, message: ServerMessage) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(message);
        }
    }

    /// Drop the connection with a transport error.
    pub fn fail(&self, reason: &str) {
        self.lifecycle.complete(Err(InterestError::Connection(reason.to_string())));
    }

    pub fn is_open(&self) -> bool {
        !self.lifecycle.is_done()
    }

    fn deliver_matching(&self, interest: &eureka_interest::Interest) {
        let limit = match self.behavior {
            Behavior::DeliverThenFail(n) => Some(n),
            _ => None,
        };
        if self.markers {
            self.push(ServerMessage::StreamState(StreamState::BufferStart));
        }
        for info in &self.catalog {
            if !interest.matches(info) {
                continue;
            }
            if limit.is_some_and(|n| self.delivered.lock().len() >= n) {
                self.fail("scripted failure");
                return;
            }
            if self.delivered.lock().insert(info.id.clone()) {
                self.push(ServerMessage::AddInstance(info.clone()));
            }
        }
        if limit.is_some_and(|n| self.delivered.lock().len() >= n) {
            self.fail("scripted failure");
            return;
        }
        if self.markers {
            self.push(ServerMessage::StreamState(StreamState::BufferEnd));
        }
    }
}

impl MessageConnection for ScriptedConnection {
    fn submit_with_ack(&self, message: ClientMessage) -> Completion<()> {
        self.messages.lock().push(message.clone());
        if !self.is_open() {
            return Completion::failed(InterestError::Connection("connection closed".to_string()));
        }
        match (&message, self.behavior) {
            (ClientMessage::InterestRegistration(_), Behavior::RejectChanges) => {
                let reason = "interest not allowed".to_string();
                Completion::failed(InterestError::ChangeRejected(reason))
            }
            (ClientMessage::InterestRegistration(interest), _) => {
                self.deliver_matching(interest);
                if self.is_open() {
                    Completion::completed(())
                } else {
                    Completion::failed(InterestError::Connection("scripted failure".to_string()))
                }
            }
            (ClientMessage::UnregisterInterest, _) => Completion::completed(()),
        }
    }

    fn incoming(&self, handler: MessageHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn lifecycle(&self) -> Completion<()> {
        self.lifecycle.clone()
    }

    fn shutdown(&self) {
        self.lifecycle.complete(Ok(()));
    }
}

/// Transport handing out [`ScriptedConnection`]s. Connections follow the
/// queued behaviors in order, then default to [`Behavior::Healthy`].
pub struct ScriptedTransport {
    catalog: Mutex<Vec<InstanceInfo>>,
    script: Mutex<VecDeque<Behavior>>,
    connections: Mutex<Vec<Arc<ScriptedConnection>>>,
    attempts: Mutex<usize>,
    markers: AtomicBool,
}

impl ScriptedTransport {
    pub fn new(catalog: Vec<InstanceInfo>) -> Arc<Self> {
        Arc::new(Self {
            catalog: Mutex::new(catalog),
            script: Mutex::new(VecDeque::new()),
            connections: Mutex::new(Vec::new()),
            attempts: Mutex::new(0),
            markers: AtomicBool::new(false),
        })
    }

    pub fn script(&self, behavior: Behavior) {
        self.script.lock().push_back(behavior);
    }

    /// Make later connections wrap every delivery in stream markers.
    pub fn use_stream_markers(&self) {
        self.markers.store(true, Ordering::SeqCst);
    }

    pub fn add_to_catalog(&self, info: InstanceInfo) {
        self.catalog.lock().push(info);
    }

    /// Established connections, oldest first.
    pub fn connection(&self, n: usize) -> Arc<ScriptedConnection> {
        Arc::clone(&self.connections.lock()[n])
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn connect_attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

impl TransportClient for ScriptedTransport {
    fn connect(&self) -> Completion<Arc<dyn MessageConnection>> {
        *self.attempts.lock() += 1;
        let behavior = self.script.lock().pop_front().unwrap_or(Behavior::Healthy);
        if behavior == Behavior::RefuseConnect {
            return Completion::failed(InterestError::Connection("connection refused".to_string()));
        }
        let connection = Arc::new(ScriptedConnection::new(
            behavior,
            self.markers.load(Ordering::SeqCst),
            self.catalog.lock().clone(),
        ));
        self.connections.lock().push(Arc::clone(&connection));
        Completion::completed(connection as Arc<dyn MessageConnection>)
    }
}

pub struct Harness {
    pub scheduler: Arc<TestScheduler>,
    pub registry: SourcedEurekaRegistry,
    pub transport: Arc<ScriptedTransport>,
    pub metrics: Arc<InMemoryMetrics>,
    pub client: EurekaInterestClient,
}

/// Client on a virtual clock with time-based batching disabled.
pub fn harness(catalog: Vec<InstanceInfo>, config: ClientConfig) -> Harness {
    init_tracing();
    let scheduler = Arc::new(TestScheduler::new());
    let registry = test_registry(&scheduler, &config.registry);
    let transport = ScriptedTransport::new(catalog);
    let metrics = Arc::new(InMemoryMetrics::new());
    let client = EurekaInterestClient::with_transport(
        registry.clone(),
        transport.clone(),
        &config,
        metrics.clone(),
    )
    .unwrap();
    Harness {
        scheduler,
        registry,
        transport,
        metrics,
        client,
    }
}

pub fn test_registry(
    scheduler: &Arc<TestScheduler>,
    config: &RegistryConfig,
) -> SourcedEurekaRegistry {
    SourcedEurekaRegistry::new(config, Arc::clone(scheduler) as Arc<dyn Scheduler>).unwrap()
}

pub fn unbatched() -> RegistryConfig {
    RegistryConfig {
        batch_quiescence_ms: 0,
        ..Default::default()
    }
}

pub fn client_config(retry_wait_ms: u64, evict_on_channel_failure: bool) -> ClientConfig {
    ClientConfig {
        retry_wait_ms,
        evict_on_channel_failure,
        registry: unbatched(),
        ..Default::default()
    }
}

pub fn instance(id: &str, app: &str) -> InstanceInfo {
    InstanceInfo::new(id, app)
}

/// Data notifications rendered as `add:<id>`, `modify:<id>`, `delete:<id>`.
pub fn labels(notifications: &[ChangeNotification]) -> Vec<String> {
    notifications
        .iter()
        .filter_map(|n| match n {
            ChangeNotification::Add(info) => Some(format!("add:{}", info.id)),
            ChangeNotification::Modify(info) => Some(format!("modify:{}", info.id)),
            ChangeNotification::Delete(id) => Some(format!("delete:{id}")),
            ChangeNotification::BufferStart | ChangeNotification::BufferEnd => None,
        })
        .collect()
}

/// Same as [`labels`] but order-insensitive.
pub fn sorted_labels(notifications: &[ChangeNotification]) -> Vec<String> {
    let mut labels = labels(notifications);
    labels.sort();
    labels
}

/// Number of (`BufferStart`, `BufferEnd`) markers.
pub fn marker_counts(notifications: &[ChangeNotification]) -> (usize, usize) {
    let starts = notifications.iter().filter(|n| **n == ChangeNotification::BufferStart).count();
    let ends = notifications.iter().filter(|n| **n == ChangeNotification::BufferEnd).count();
    (starts, ends)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
