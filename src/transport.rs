//! Contracts for the transport layer the channel runs on.
//!
//! Encoding, framing and sockets belong to the transport implementation;
//! this module only fixes the messages exchanged and the shape of a
//! connection.

use crate::completion::Completion;
use crate::interests::Interest;
use crate::types::{InstanceId, InstanceInfo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Messages sent by the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Replace the subscription on the remote side with this interest.
    InterestRegistration(Interest),
    /// Drop the subscription; sent best-effort before a clean close.
    UnregisterInterest,
}

/// Burst boundaries announced by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    BufferStart,
    BufferEnd,
}

/// Messages pushed by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum ServerMessage {
    AddInstance(InstanceInfo),
    UpdateInstance(InstanceInfo),
    DeleteInstance(InstanceId),
    StreamState(StreamState),
}

/// Callback receiving every message pushed on a connection.
pub type MessageHandler = Arc<dyn Fn(ServerMessage) + Send + Sync>;

/// An established connection to the remote registry.
pub trait MessageConnection: Send + Sync {
    /// Send `message`; resolves when the remote side acknowledges it.
    fn submit_with_ack(&self, message: ClientMessage) -> Completion<()>;

    /// Install the handler for pushed messages.
    fn incoming(&self, handler: MessageHandler);

    /// Resolves when the connection ends: `Ok` on a clean close, `Err` on a
    /// transport failure.
    fn lifecycle(&self) -> Completion<()>;

    fn shutdown(&self);
}

/// Opens connections to the remote registry.
pub trait TransportClient: Send + Sync {
    fn connect(&self) -> Completion<Arc<dyn MessageConnection>>;
}
