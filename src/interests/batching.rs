//! Per-source burst detection.
//!
//! A batch opens on the first notification from a source after an idle
//! period and closes once the source has been quiet for the quiescence
//! window. Sources may also open and close batches explicitly (server-sent
//! stream markers); explicit batches ignore the window.

use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
struct BatchState {
    last_activity: Duration,
    explicit: bool,
}

/// Effect of a notification on the source's batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchTransition {
    /// A new timed batch opened; schedule a quiescence check after the window.
    Opened,
    /// The notification joined an already open batch.
    Extended,
    /// Batching is off for this source.
    Disabled,
}

/// Outcome of a quiescence check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quiescence {
    /// The source has been quiet for the full window; the batch is closed.
    Closed,
    /// Activity happened since; check again after the given delay.
    Recheck(Duration),
    /// No timed batch is open for the source.
    Idle,
}

/// Tracks open batches by source id.
///
/// Not synchronized: the owning registry serializes every call.
#[derive(Debug)]
pub struct BatchingRegistry {
    window: Duration,
    batches: HashMap<u64, BatchState>,
}

impl BatchingRegistry {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            batches: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a notification from `source_id` at `now`.
    pub fn on_notification(&mut self, source_id: u64, now: Duration) -> BatchTransition {
        if let Some(state) = self.batches.get_mut(&source_id) {
            state.last_activity = now;
            return BatchTransition::Extended;
        }
        if self.window.is_zero() {
            return BatchTransition::Disabled;
        }
        self.batches.insert(
            source_id,
            BatchState {
                last_activity: now,
                explicit: false,
            },
        );
        BatchTransition::Opened
    }

    pub fn check_quiescence(&mut self, source_id: u64, now: Duration) -> Quiescence {
        let Some(state) = self.batches.get(&source_id) else {
            return Quiescence::Idle;
        };
        if state.explicit {
            return Quiescence::Idle;
        }
        let quiet_for = now.saturating_sub(state.last_activity);
        if quiet_for >= self.window {
            self.batches.remove(&source_id);
            Quiescence::Closed
        } else {
            Quiescence::Recheck(self.window - quiet_for)
        }
    }

    /// Open (or pin) a batch until [`close_explicit`](Self::close_explicit).
    /// Returns true if no batch was open before.
    pub fn open_explicit(&mut self, source_id: u64, now: Duration) -> bool {
        match self.batches.get_mut(&source_id) {
            Some(state) => {
                state.explicit = true;
                state.last_activity = now;
                false
            }
            None => {
                self.batches.insert(
                    source_id,
                    BatchState {
                        last_activity: now,
                        explicit: true,
                    },
                );
                true
            }
        }
    }

    /// Close a batch regardless of how it was opened. Returns true if one
    /// was open.
    pub fn close_explicit(&mut self, source_id: u64) -> bool {
        self.batches.remove(&source_id).is_some()
    }

    pub fn is_open(&self, source_id: u64) -> bool {
        self.batches.contains_key(&source_id)
    }

    pub fn open_batches(&self) -> usize {
        self.batches.len()
    }
}
