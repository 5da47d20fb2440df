//! Cooperative discrete-event loop used to drive deferred callbacks.
//!
//! Tasks are registered by weak reference. The owner of a task keeps the only strong reference,
//! so dropping the owner cancels every pending firing of that task; the stale entry is discarded
//! the next time it comes due.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::rc::Weak;

use tracing::trace;

pub trait Task {
    /// Called when the task comes due. `now_ms` is the scheduled firing time.
    fn fire(&self, now_ms: u64) -> TaskAction;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskAction {
    /// Fire again after the given number of milliseconds (minimum 1).
    Rearm(u64),
    /// Do not fire again.
    Finish,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

pub struct EventLoop {
    now_ms: u64,
    next_task_id: u64,
    // Breaks ties between firings due at the same time, in scheduling order
    next_seq: u64,
    queue: BinaryHeap<Reverse<(u64, u64, TaskId)>>,
    tasks: HashMap<TaskId, Weak<dyn Task>>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new(0)
    }
}

impl EventLoop {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms,
            next_task_id: 0,
            next_seq: 0,
            queue: BinaryHeap::new(),
            tasks: HashMap::new(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Schedules `task` to fire `delay_ms` from now. The returned id remains valid across
    /// rearms, and may be passed to [`EventLoop::cancel`].
    pub fn schedule_after(&mut self, delay_ms: u64, task: Weak<dyn Task>) -> TaskId {
        let id = TaskId(self.next_task_id);
        self.next_task_id += 1;

        self.tasks.insert(id, task);
        self.push(self.now_ms.saturating_add(delay_ms), id);

        id
    }

    /// Cancels a pending task. Cancelling a finished or unknown task has no effect.
    pub fn cancel(&mut self, id: TaskId) {
        self.tasks.remove(&id);
    }

    /// Returns the number of tasks whose owners are still alive.
    pub fn pending(&self) -> usize {
        self.tasks
            .values()
            .filter(|task| task.strong_count() > 0)
            .count()
    }

    /// Returns the time at which the next live task will fire, if one exists.
    pub fn next_firing_ms(&self) -> Option<u64> {
        self.queue
            .iter()
            .filter(|Reverse((_, _, id))| {
                self.tasks
                    .get(id)
                    .map_or(false, |task| task.strong_count() > 0)
            })
            .map(|Reverse((time_ms, _, _))| *time_ms)
            .min()
    }

    /// Advances the clock to `time_ms`, firing every task due at or before that time in order.
    ///
    /// # Panics
    ///
    /// Panics if `time_ms` is earlier than the current time.
    pub fn advance_to(&mut self, time_ms: u64) {
        assert!(time_ms >= self.now_ms, "attempt to advance into the past");

        while let Some(&Reverse((due_ms, _, id))) = self.queue.peek() {
            if due_ms > time_ms {
                break;
            }

            self.queue.pop();
            self.now_ms = due_ms;

            let task = match self.tasks.get(&id) {
                Some(weak) => weak.upgrade(),
                // Cancelled
                None => continue,
            };

            let action = match task {
                Some(task) => task.fire(due_ms),
                None => {
                    // The owner went out of scope, let it fall off the queue
                    trace!(?id, "discarding task with dropped owner");
                    TaskAction::Finish
                }
            };

            match action {
                TaskAction::Rearm(period_ms) => {
                    self.push(due_ms.saturating_add(period_ms.max(1)), id);
                }
                TaskAction::Finish => {
                    self.tasks.remove(&id);
                }
            }
        }

        self.now_ms = time_ms;
    }

    /// Advances the clock by `delta_ms`.
    pub fn advance_by(&mut self, delta_ms: u64) {
        self.advance_to(self.now_ms.saturating_add(delta_ms));
    }

    fn push(&mut self, due_ms: u64, id: TaskId) {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.queue.push(Reverse((due_ms, seq, id)));
    }
}
