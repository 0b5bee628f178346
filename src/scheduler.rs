//! Serialized execution context.
//!
//! Every mutation of registry, channel and client state runs as a task on a
//! [`Scheduler`]. A scheduler runs one task at a time, so tasks never
//! interleave. Two implementations are provided:
//!
//! - [`ThreadScheduler`]: a dedicated worker thread fed by a crossbeam
//!   channel, with a timer queue for delayed tasks.
//! - [`TestScheduler`]: a virtual clock driven explicitly by the caller via
//!   [`TestScheduler::trigger_actions`] and [`TestScheduler::advance_time_by`].

use crate::error::{InterestError, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// A unit of work for the scheduler.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a delayed task so it can be cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// Single-consumer execution context with timers.
pub trait Scheduler: Send + Sync {
    /// Run `task` as soon as possible, after every task already queued.
    fn execute(&self, task: Task);

    /// Run `task` once `delay` has elapsed.
    fn schedule(&self, delay: Duration, task: Task) -> TimerId;

    /// Cancel a delayed task. Cancelling a fired or unknown timer is a no-op.
    fn cancel(&self, timer: TimerId);

    /// Time elapsed since the scheduler was created.
    fn now(&self) -> Duration;
}

// --- Test scheduler ---

struct VirtualClock {
    now: Duration,
    next_id: u64,
    /// Tasks keyed by (deadline, id); ids grow monotonically, so tasks with
    /// equal deadlines run in submission order.
    queue: BTreeMap<(Duration, u64), Task>,
    deadlines: HashMap<u64, Duration>,
}

/// Deterministic scheduler with a virtual clock.
///
/// Nothing runs until the owner calls [`trigger_actions`](Self::trigger_actions)
/// or [`advance_time_by`](Self::advance_time_by); tasks then run on the
/// calling thread.
pub struct TestScheduler {
    clock: Mutex<VirtualClock>,
}

impl TestScheduler {
    pub fn new() -> Self {
        Self {
            clock: Mutex::new(VirtualClock {
                now: Duration::ZERO,
                next_id: 1,
                queue: BTreeMap::new(),
                deadlines: HashMap::new(),
            }),
        }
    }

    /// Run every task due at the current virtual time, including tasks
    /// queued by the tasks being run.
    pub fn trigger_actions(&self) {
        while let Some(task) = self.pop_due(None) {
            task();
        }
    }

    /// Move the virtual clock forward, running timers in deadline order.
    pub fn advance_time_by(&self, delta: Duration) {
        let target = self.clock.lock().now + delta;
        while let Some(task) = self.pop_due(Some(target)) {
            task();
        }
        let mut clock = self.clock.lock();
        if clock.now < target {
            clock.now = target;
        }
    }

    /// Number of tasks waiting, due or not.
    pub fn pending_tasks(&self) -> usize {
        self.clock.lock().queue.len()
    }

    fn pop_due(&self, until: Option<Duration>) -> Option<Task> {
        let mut clock = self.clock.lock();
        let limit = until.unwrap_or(clock.now);
        let key = *clock.queue.keys().next()?;
        if key.0 > limit {
            return None;
        }
        let task = clock.queue.remove(&key)?;
        clock.deadlines.remove(&key.1);
        if key.0 > clock.now {
            clock.now = key.0;
        }
        Some(task)
    }

    fn enqueue(&self, delay: Duration, task: Task) -> TimerId {
        let mut clock = self.clock.lock();
        let id = clock.next_id;
        clock.next_id += 1;
        let deadline = clock.now + delay;
        clock.queue.insert((deadline, id), task);
        clock.deadlines.insert(id, deadline);
        TimerId(id)
    }
}

impl Default for TestScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TestScheduler {
    fn execute(&self, task: Task) {
        self.enqueue(Duration::ZERO, task);
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerId {
        self.enqueue(delay, task)
    }

    fn cancel(&self, timer: TimerId) {
        let mut clock = self.clock.lock();
        if let Some(deadline) = clock.deadlines.remove(&timer.0) {
            clock.queue.remove(&(deadline, timer.0));
        }
    }

    fn now(&self) -> Duration {
        self.clock.lock().now
    }
}

// --- Thread scheduler ---

enum Command {
    Run(Task),
    Schedule { id: u64, deadline: Instant, task: Task },
    Cancel(u64),
    Stop,
}

/// Scheduler backed by one dedicated worker thread.
pub struct ThreadScheduler {
    sender: Sender<Command>,
    started: Instant,
    next_id: Mutex<u64>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl ThreadScheduler {
    /// Spawn the worker thread.
    pub fn start(name: &str) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_worker(receiver))
            .map_err(|e| InterestError::Scheduler(e.to_string()))?;

        Ok(Self {
            sender,
            started: Instant::now(),
            next_id: Mutex::new(1),
            worker_id: handle.thread().id(),
            worker: Mutex::new(Some(handle)),
        })
    }

    fn send(&self, command: Command) {
        if self.sender.send(command).is_err() {
            tracing::warn!("Scheduler worker is gone, dropping task");
        }
    }
}

impl Scheduler for ThreadScheduler {
    fn execute(&self, task: Task) {
        self.send(Command::Run(task));
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerId {
        let id = {
            let mut next = self.next_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        self.send(Command::Schedule {
            id,
            deadline: Instant::now() + delay,
            task,
        });
        TimerId(id)
    }

    fn cancel(&self, timer: TimerId) {
        self.send(Command::Cancel(timer.0));
    }

    fn now(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Stop);
        // The last handle may be dropped by a task running on the worker.
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run_worker(receiver: Receiver<Command>) {
    let mut timers: BTreeMap<(Instant, u64), Task> = BTreeMap::new();
    let mut deadlines: HashMap<u64, Instant> = HashMap::new();

    loop {
        // Fire everything that is due before waiting again.
        let now = Instant::now();
        while let Some(&key) = timers.keys().next() {
            if key.0 > now {
                break;
            }
            if let Some(task) = timers.remove(&key) {
                deadlines.remove(&key.1);
                run_task(task);
            }
        }

        let command = match timers.keys().next() {
            Some(&(deadline, _)) => {
                match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match receiver.recv() {
                Ok(command) => command,
                Err(_) => return,
            },
        };

        match command {
            Command::Run(task) => run_task(task),
            Command::Schedule { id, deadline, task } => {
                timers.insert((deadline, id), task);
                deadlines.insert(id, deadline);
            }
            Command::Cancel(id) => {
                if let Some(deadline) = deadlines.remove(&id) {
                    timers.remove(&(deadline, id));
                }
            }
            Command::Stop => return,
        }
    }
}

fn run_task(task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        tracing::error!("Scheduled task panicked");
    }
}
