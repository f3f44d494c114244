//! Cooperative task queue with a virtual clock.
//!
//! Nothing runs on its own: the embedder (or a test) drives time with
//! [`Scheduler::run_pending`] and [`Scheduler::advance`]. A "turn" runs every
//! task that was due when the turn started; tasks submitted while a turn is
//! running wait for the next one.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

type Task = Box<dyn FnOnce()>;

struct Scheduled {
    seq: u64,
    due: Duration,
    cancelled: Rc<Cell<bool>>,
    task: Task,
}

#[derive(Default)]
struct SchedulerState {
    now: Duration,
    next_seq: u64,
    queue: Vec<Scheduled>,
}

#[derive(Clone, Default)]
pub struct Scheduler(Rc<RefCell<SchedulerState>>);

/// Handle to a submitted task. Dropping it does not cancel the task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cancelled: Rc<Cell<bool>>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` on the next turn.
    pub fn submit(&self, task: impl FnOnce() + 'static) -> TaskHandle {
        self.submit_after(Duration::ZERO, task)
    }

    pub fn submit_after(&self, delay: Duration, task: impl FnOnce() + 'static) -> TaskHandle {
        let cancelled = Rc::new(Cell::new(false));
        let mut state = self.0.borrow_mut();
        state.next_seq += 1;
        let scheduled = Scheduled {
            seq: state.next_seq,
            due: state.now + delay,
            cancelled: cancelled.clone(),
            task: Box::new(task),
        };
        state.queue.push(scheduled);
        TaskHandle { cancelled }
    }

    pub fn now(&self) -> Duration {
        self.0.borrow().now
    }

    pub fn pending(&self) -> usize {
        self.0
            .borrow()
            .queue
            .iter()
            .filter(|t| !t.cancelled.get())
            .count()
    }

    /// Run one turn. Returns the number of tasks executed.
    pub fn run_pending(&self) -> usize {
        let mut due: Vec<Scheduled> = {
            let mut state = self.0.borrow_mut();
            let now = state.now;
            let (ready, waiting): (Vec<_>, Vec<_>) =
                state.queue.drain(..).partition(|t| t.due <= now);
            state.queue = waiting;
            ready
        };
        due.sort_by_key(|t| (t.due, t.seq));
        let mut ran = 0;
        for scheduled in due {
            if scheduled.cancelled.get() {
                continue;
            }
            (scheduled.task)();
            ran += 1;
        }
        ran
    }

    /// Move the clock forward and run one turn.
    pub fn advance(&self, by: Duration) -> usize {
        {
            let mut state = self.0.borrow_mut();
            state.now += by;
        }
        self.run_pending()
    }

    /// Run turns until nothing is due, up to `max_turns`.
    pub fn flush(&self, max_turns: usize) -> usize {
        let mut total = 0;
        for _ in 0..max_turns {
            let ran = self.run_pending();
            if ran == 0 && !self.has_due() {
                break;
            }
            total += ran;
        }
        total
    }

    fn has_due(&self) -> bool {
        let state = self.0.borrow();
        state
            .queue
            .iter()
            .any(|t| t.due <= state.now && !t.cancelled.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_wait_for_a_turn() {
        let sched = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        sched.submit(move || l.borrow_mut().push("a"));
        assert!(log.borrow().is_empty());
        assert_eq!(sched.run_pending(), 1);
        assert_eq!(*log.borrow(), vec!["a"]);
    }

    #[test]
    fn test_nested_submission_runs_next_turn() {
        let sched = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let (s, l) = (sched.clone(), log.clone());
        sched.submit(move || {
            l.borrow_mut().push(1);
            let l2 = l.clone();
            s.submit(move || l2.borrow_mut().push(2));
        });
        sched.run_pending();
        assert_eq!(*log.borrow(), vec![1]);
        sched.run_pending();
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_delay_and_cancel() {
        let sched = Scheduler::new();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        sched.submit_after(Duration::from_millis(50), move || h.set(h.get() + 1));
        let h = hits.clone();
        let handle = sched.submit(move || h.set(h.get() + 100));
        handle.cancel();
        assert_eq!(sched.run_pending(), 0);
        assert_eq!(sched.advance(Duration::from_millis(49)), 0);
        assert_eq!(sched.advance(Duration::from_millis(1)), 1);
        assert_eq!(hits.get(), 1);
        assert_eq!(sched.pending(), 0);
    }
}
