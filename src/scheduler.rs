use crate::Result;
use crossbeam_channel::{RecvTimeoutError, Sender};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs a callback once after a delay.
pub trait TimeoutScheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledTask;
}

const TASK_PENDING: u8 = 0;
const TASK_STARTED: u8 = 1;
const TASK_CANCELLED: u8 = 2;

struct TaskSlot {
    state: AtomicU8,
    /// Taken when the task starts or is cancelled.
    task: Mutex<Option<Task>>,
}

/// Handle to a task submitted to a [`TimeoutScheduler`].
///
/// Cancellation is best effort: it never blocks, and has no effect once the
/// task has started running. A cancelled task is dropped right away, together
/// with everything its closure captured.
#[derive(Clone)]
pub struct ScheduledTask {
    slot: Arc<TaskSlot>,
}

impl ScheduledTask {
    pub(crate) fn new(task: Task) -> ScheduledTask {
        ScheduledTask {
            slot: Arc::new(TaskSlot {
                state: AtomicU8::new(TASK_PENDING),
                task: Mutex::new(Some(task)),
            }),
        }
    }

    /// A handle whose task will never run.
    pub fn cancelled() -> ScheduledTask {
        ScheduledTask {
            slot: Arc::new(TaskSlot {
                state: AtomicU8::new(TASK_CANCELLED),
                task: Mutex::new(None),
            }),
        }
    }

    fn transition(&self, to: u8) -> bool {
        self.slot
            .state
            .compare_exchange(TASK_PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn take_task(&self) -> Option<Task> {
        self.slot.task.lock().unwrap().take()
    }

    /// Returns `true` if this call prevented the task from running.
    pub fn cancel(&self) -> bool {
        if !self.transition(TASK_CANCELLED) {
            return false;
        }
        drop(self.take_task());
        true
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.slot.state.load(Ordering::Acquire) == TASK_CANCELLED
    }

    /// Run the task on the calling thread unless it was cancelled first.
    pub(crate) fn run(&self) {
        if !self.transition(TASK_STARTED) {
            return;
        }
        let task = match self.take_task() {
            Some(task) => task,
            None => return,
        };
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!(
                "scheduled task panicked in thread `{}`",
                thread::current().name().unwrap_or("unnamed")
            );
        }
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.slot.state.load(Ordering::Acquire) {
            TASK_PENDING => "pending",
            TASK_STARTED => "started",
            _ => "cancelled",
        };
        f.debug_struct("ScheduledTask").field("state", &state).finish()
    }
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    handle: ScheduledTask,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match self.deadline.cmp(&other.deadline) {
            CmpOrdering::Equal => self.seq.cmp(&other.seq),
            o => o,
        }
    }
}

/// [`TimeoutScheduler`] backed by one background thread.
///
/// Tasks are sent over a channel and kept in a min-heap ordered by deadline.
/// Dropping the scheduler closes the channel and joins the thread; tasks that
/// have not fired yet are discarded.
pub struct TimerThread {
    sender: Option<Sender<TimerEntry>>,
    handle: Option<JoinHandle<()>>,
    seq: AtomicU64,
}

impl TimerThread {
    pub fn start() -> Result<TimerThread> {
        let (sender, receiver) = crossbeam_channel::unbounded::<TimerEntry>();

        let handle = thread::Builder::new()
            .name("lock timeout scheduler".to_owned())
            .spawn(move || {
                info!("thread `{}` start!", thread_name());
                let mut heap: BinaryHeap<Reverse<TimerEntry>> = BinaryHeap::new();
                loop {
                    let now = Instant::now();
                    while heap
                        .peek()
                        .map_or(false, |Reverse(entry)| entry.deadline <= now)
                    {
                        if let Some(Reverse(entry)) = heap.pop() {
                            entry.handle.run();
                        }
                    }

                    let received = match heap.peek() {
                        Some(Reverse(next)) => receiver
                            .recv_timeout(next.deadline.saturating_duration_since(Instant::now())),
                        None => receiver
                            .recv()
                            .map_err(|_| RecvTimeoutError::Disconnected),
                    };
                    match received {
                        Ok(entry) => heap.push(Reverse(entry)),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!(
                    "thread `{}` exit! {} pending tasks discarded",
                    thread_name(),
                    heap.len()
                );
            })?;

        Ok(TimerThread {
            sender: Some(sender),
            handle: Some(handle),
            seq: AtomicU64::new(0),
        })
    }
}

fn thread_name() -> String {
    thread::current().name().unwrap_or("unnamed").to_owned()
}

impl TimeoutScheduler for TimerThread {
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledTask {
        let deadline = match Instant::now().checked_add(delay) {
            Some(deadline) => deadline,
            // never fires
            None => return ScheduledTask::cancelled(),
        };
        let handle = ScheduledTask::new(task);
        let entry = TimerEntry {
            deadline,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            handle: handle.clone(),
        };
        match &self.sender {
            Some(sender) => {
                if let Err(e) = sender.send(entry) {
                    warn!("{}", e);
                    handle.cancel();
                }
            }
            None => {
                handle.cancel();
            }
        }
        handle
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("lock timeout scheduler exited abnormally");
            }
        }
    }
}
