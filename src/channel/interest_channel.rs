//! Interest channel state machine.

use crate::channel::ChannelContext;
use crate::completion::Completion;
use crate::error::{InterestError, Result};
use crate::interests::Interest;
use crate::metrics::Counter;
use crate::transport::{ClientMessage, MessageConnection, ServerMessage, StreamState};
use crate::types::{Origin, Source};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

/// Channel lifecycle. `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Connected,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Idle => "idle",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

struct ChannelCore {
    state: ChannelState,
    /// Latest interest requested; sent once connected.
    requested: Option<Interest>,
    connection: Option<Arc<dyn MessageConnection>>,
    /// Changes waiting for the connection to come up.
    waiting: Vec<Completion<()>>,
    /// Every interest passed to `change`, in call order.
    history: Vec<Interest>,
}

struct ChannelInner {
    id: u64,
    source: Source,
    context: ChannelContext,
    evict_on_close: bool,
    lifecycle: Completion<()>,
    core: Mutex<ChannelCore>,
}

/// One subscription session with the remote registry.
///
/// Data received on the channel is registered under the channel's own
/// [`Source`]; when the channel closes for any reason that data is evicted
/// (unless eviction was deferred to the owner). A closed channel is never
/// reused.
#[derive(Clone)]
pub struct InterestChannel {
    inner: Arc<ChannelInner>,
}

impl InterestChannel {
    pub fn new(id: u64, name: &str, context: ChannelContext, evict_on_close: bool) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id,
                source: Source::new(Origin::Interested, format!("{name}-{id}")),
                context,
                evict_on_close,
                lifecycle: Completion::new(),
                core: Mutex::new(ChannelCore {
                    state: ChannelState::Idle,
                    requested: None,
                    connection: None,
                    waiting: Vec::new(),
                    history: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn source(&self) -> &Source {
        &self.inner.source
    }

    pub fn state(&self) -> ChannelState {
        self.inner.core.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Interest most recently applied by the state machine.
    pub fn requested_interest(&self) -> Option<Interest> {
        self.inner.core.lock().requested.clone()
    }

    /// Every interest passed to [`change`](Self::change), in call order.
    pub fn change_history(&self) -> Vec<Interest> {
        self.inner.core.lock().history.clone()
    }

    /// Resolves once the channel is closed: `Ok` after an explicit close,
    /// `Err` with the cause after a failure.
    pub fn lifecycle(&self) -> Completion<()> {
        self.inner.lifecycle.clone()
    }

    /// Ask the remote side to subscribe to `interest`, replacing whatever
    /// was subscribed before. The first call opens the connection.
    ///
    /// Resolves when the remote side acknowledges the interest.
    pub fn change(&self, interest: Interest) -> Completion<()> {
        self.inner.core.lock().history.push(interest.clone());

        let completion = Completion::new();
        let pending = completion.clone();
        let weak = Arc::downgrade(&self.inner);
        self.inner.context.scheduler.execute(Box::new(move || match weak.upgrade() {
            Some(inner) => inner.handle_change(interest, pending),
            None => {
                pending.complete(Err(InterestError::ChannelClosed));
            }
        }));
        completion
    }

    /// Close the channel and evict its data.
    pub fn close(&self) {
        self.inner.close_with(None);
    }
}

impl fmt::Debug for InterestChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterestChannel")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("state", &self.state())
            .finish()
    }
}

impl ChannelInner {
    fn handle_change(self: &Arc<Self>, interest: Interest, completion: Completion<()>) {
        let mut core = self.core.lock();
        match core.state {
            ChannelState::Closed => {
                drop(core);
                completion.complete(Err(InterestError::ChannelClosed));
            }
            ChannelState::Idle => {
                core.state = ChannelState::Connecting;
                core.requested = Some(interest);
                core.waiting.push(completion);
                drop(core);
                tracing::debug!(
                    channel = self.id,
                    source = %self.source,
                    "Connecting interest channel"
                );
                self.connect();
            }
            ChannelState::Connecting => {
                // Only the latest interest is sent once connected.
                core.requested = Some(interest);
                core.waiting.push(completion);
            }
            ChannelState::Connected => {
                core.requested = Some(interest.clone());
                let connection = core.connection.clone();
                drop(core);
                match connection {
                    Some(connection) => self.send_interest(connection, interest, vec![completion]),
                    None => {
                        completion.complete(Err(InterestError::ChannelClosed));
                    }
                }
            }
        }
    }

    fn connect(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let scheduler = Arc::clone(&self.context.scheduler);
        self.context.transport.connect().on_complete(move |result| {
            scheduler.execute(Box::new(move || match weak.upgrade() {
                Some(inner) => inner.on_connected(result),
                None => {
                    if let Ok(connection) = result {
                        connection.shutdown();
                    }
                }
            }));
        });
    }

    fn on_connected(self: &Arc<Self>, result: Result<Arc<dyn MessageConnection>>) {
        let connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                self.close_with(Some(as_connection_error(e)));
                return;
            }
        };

        let (interest, waiting) = {
            let mut core = self.core.lock();
            if core.state != ChannelState::Connecting {
                drop(core);
                connection.shutdown();
                return;
            }
            core.state = ChannelState::Connected;
            core.connection = Some(Arc::clone(&connection));
            (core.requested.clone(), std::mem::take(&mut core.waiting))
        };
        tracing::info!(channel = self.id, source = %self.source, "Interest channel connected");

        let weak = Arc::downgrade(self);
        let scheduler = Arc::clone(&self.context.scheduler);
        connection.incoming(Arc::new(move |message: ServerMessage| {
            let weak: Weak<ChannelInner> = weak.clone();
            scheduler.execute(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_message(message);
                }
            }));
        }));

        let weak = Arc::downgrade(self);
        let scheduler = Arc::clone(&self.context.scheduler);
        connection.lifecycle().on_complete(move |result| {
            scheduler.execute(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_disconnected(result);
                }
            }));
        });

        match interest {
            Some(interest) => self.send_interest(connection, interest, waiting),
            None => {
                for completion in waiting {
                    completion.complete(Ok(()));
                }
            }
        }
    }

    fn send_interest(
        self: &Arc<Self>,
        connection: Arc<dyn MessageConnection>,
        interest: Interest,
        waiting: Vec<Completion<()>>,
    ) {
        tracing::debug!(channel = self.id, interest = %interest, "Sending interest");
        self.context.metrics.increment(Counter::InterestChangeSent, 1);

        let weak = Arc::downgrade(self);
        let scheduler = Arc::clone(&self.context.scheduler);
        connection
            .submit_with_ack(ClientMessage::InterestRegistration(interest))
            .on_complete(move |result| {
                scheduler.execute(Box::new(move || match weak.upgrade() {
                    Some(inner) => inner.on_ack(result, waiting),
                    None => {
                        for completion in waiting {
                            completion.complete(Err(InterestError::ChannelClosed));
                        }
                    }
                }));
            });
    }

    fn on_ack(self: &Arc<Self>, result: Result<()>, waiting: Vec<Completion<()>>) {
        match result {
            Ok(()) => {
                for completion in waiting {
                    completion.complete(Ok(()));
                }
            }
            Err(e) => {
                self.context.metrics.increment(Counter::InterestChangeFailed, 1);
                let error = match e {
                    InterestError::ChangeRejected(_) => e,
                    other => InterestError::ChangeRejected(other.to_string()),
                };
                for completion in waiting {
                    completion.complete(Err(error.clone()));
                }
                self.close_with(Some(error));
            }
        }
    }

    fn on_message(self: &Arc<Self>, message: ServerMessage) {
        if self.core.lock().state != ChannelState::Connected {
            tracing::debug!(channel = self.id, "Dropping message received on inactive channel");
            return;
        }

        let registry = &self.context.registry;
        let outcome = match message {
            ServerMessage::AddInstance(info) | ServerMessage::UpdateInstance(info) => {
                registry.register(info, &self.source).map(|_| ())
            }
            ServerMessage::DeleteInstance(id) => registry.unregister(&id, &self.source).map(|_| ()),
            ServerMessage::StreamState(StreamState::BufferStart) => {
                registry.begin_batch(&self.source)
            }
            ServerMessage::StreamState(StreamState::BufferEnd) => {
                registry.end_batch(&self.source)
            }
        };

        let id = self.id;
        outcome.on_complete(move |result| {
            if let Err(e) = result {
                tracing::debug!(channel = id, error = %e, "Registry rejected channel update");
            }
        });
    }

    fn on_disconnected(self: &Arc<Self>, result: Result<()>) {
        let error = match result {
            Ok(()) => InterestError::Connection("connection closed by remote".to_string()),
            Err(e) => as_connection_error(e),
        };
        self.close_with(Some(error));
    }

    /// Move to `Closed`; no-op if already closed.
    fn close_with(&self, error: Option<InterestError>) {
        let (connection, waiting) = {
            let mut core = self.core.lock();
            if core.state == ChannelState::Closed {
                return;
            }
            core.state = ChannelState::Closed;
            (core.connection.take(), std::mem::take(&mut core.waiting))
        };

        match &error {
            Some(e) => {
                tracing::warn!(
                    channel = self.id,
                    source = %self.source,
                    error = %e,
                    "Interest channel failed"
                );
                self.context.metrics.increment(Counter::ChannelFailed, 1);
            }
            None => {
                tracing::info!(channel = self.id, source = %self.source, "Interest channel closed")
            }
        }

        if let Some(connection) = connection {
            if error.is_none() {
                // Best effort; the ack is not awaited.
                let id = self.id;
                connection
                    .submit_with_ack(ClientMessage::UnregisterInterest)
                    .on_complete(move |result| {
                        if let Err(e) = result {
                            tracing::debug!(
                                channel = id,
                                error = %e,
                                "Unregister not acknowledged"
                            );
                        }
                    });
            }
            connection.shutdown();
        }

        let failure = error.clone().unwrap_or(InterestError::ChannelClosed);
        for completion in waiting {
            completion.complete(Err(failure.clone()));
        }

        let source = self.source.clone();
        if self.evict_on_close {
            // Eviction also ends any batch the server left open.
            self.context.registry.evict_all(&self.source).on_complete(move |result| {
                if let Err(e) = result {
                    tracing::debug!(source = %source, error = %e, "Eviction skipped");
                }
            });
        } else {
            self.context.registry.end_batch(&self.source).on_complete(move |result| {
                if let Err(e) = result {
                    tracing::debug!(source = %source, error = %e, "Batch close skipped");
                }
            });
        }

        self.lifecycle.complete(match error {
            Some(e) => Err(e),
            None => Ok(()),
        });
    }
}

fn as_connection_error(error: InterestError) -> InterestError {
    match error {
        InterestError::Connection(_) => error,
        other => InterestError::Connection(other.to_string()),
    }
}
