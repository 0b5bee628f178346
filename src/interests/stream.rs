//! Subscriber-side handle for interest notifications.

use crate::interests::Interest;
use crate::types::ChangeNotification;
use crossbeam_channel::{unbounded, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Live stream of notifications for one interest.
///
/// The stream completes (receivers report disconnection once drained) when
/// the subscription is cancelled or the owning registry or client shuts
/// down. Dropping the stream cancels the subscription; the registry notices
/// on its next delivery attempt.
#[derive(Debug)]
pub struct NotificationStream {
    pub id: SubscriptionId,
    pub interest: Interest,
    receiver: Receiver<ChangeNotification>,
}

impl NotificationStream {
    pub(crate) fn pair(
        id: SubscriptionId,
        interest: Interest,
    ) -> (Sender<ChangeNotification>, Self) {
        let (sender, receiver) = unbounded();
        (
            sender,
            Self {
                id,
                interest,
                receiver,
            },
        )
    }

    /// Receive the next notification (blocking).
    pub fn recv(&self) -> Result<ChangeNotification, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a notification (non-blocking).
    pub fn try_recv(&self) -> Result<ChangeNotification, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<ChangeNotification, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything buffered right now.
    pub fn drain(&self) -> Vec<ChangeNotification> {
        self.receiver.try_iter().collect()
    }

    /// Buffered Add/Modify/Delete notifications, skipping buffer markers.
    pub fn drain_data(&self) -> Vec<ChangeNotification> {
        self.receiver.try_iter().filter(ChangeNotification::is_data).collect()
    }

    /// True once the stream is drained and no more notifications can arrive.
    pub fn is_completed(&self) -> bool {
        self.receiver.is_empty()
            && matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub fn receiver(&self) -> &Receiver<ChangeNotification> {
        &self.receiver
    }
}
