//! Cooperative tasks.
//!
//! A [`Task`] is the consumer side of one asynchronous computation and a
//! [`Frame`] is its producer side. A frame either completes the task right
//! away or suspends it, handing out a one-shot [`Continuation`] that some
//! external event resumes later. All completions travel through the
//! [`Scheduler`] ready queue, so long chains of already-completed tasks never
//! grow the call stack.
//!
//! ```
//! use shiori::task::Scheduler;
//!
//! let scheduler = Scheduler::new();
//! let (frame, task) = scheduler.frame::<u32>("answer");
//! let continuation = frame.suspend("waiting for the answer");
//!
//! let doubled = task.map(|value| value * 2);
//! continuation.schedule(21);
//!
//! assert_eq!(scheduler.block_on(doubled).unwrap(), 42);
//! ```
mod fetcher;
mod scheduler;

use std::borrow::Cow;
use std::cell::RefCell;
use std::rc::Rc;

pub use crate::task::fetcher::{Fetcher, wait_for_fetchers};
pub use crate::task::scheduler::{RemoteContinuation, Scheduler};

use crate::error::TaskError;

/// The terminal result of a task.
pub type Outcome<T> = Result<T, TaskError>;

type Observer<T> = Box<dyn FnOnce(Outcome<T>)>;

enum State<T> {
    Pending(Option<Observer<T>>),
    /// Completed before anyone observed it.
    Ready(Outcome<T>),
    Delivered,
}

struct Shared<T> {
    name: Cow<'static, str>,
    scheduler: Scheduler,
    state: RefCell<State<T>>,
}

impl<T: 'static> Shared<T> {
    fn new(scheduler: Scheduler, name: Cow<'static, str>, state: State<T>) -> Rc<Self> {
        Rc::new(Self {
            name,
            scheduler,
            state: RefCell::new(state),
        })
    }

    /// Stores the outcome or queues the observer. Returns `false` when the
    /// task had already completed.
    fn complete(&self, outcome: Outcome<T>) -> bool {
        let mut state = self.state.borrow_mut();
        match std::mem::replace(&mut *state, State::Delivered) {
            State::Pending(Some(observer)) => {
                drop(state);
                self.scheduler.enqueue(move || observer(outcome));
                true
            }
            State::Pending(None) => {
                *state = State::Ready(outcome);
                true
            }
            done => {
                *state = done;
                false
            }
        }
    }

    fn observe(&self, observer: Observer<T>) {
        let mut state = self.state.borrow_mut();
        match std::mem::replace(&mut *state, State::Delivered) {
            State::Pending(None) => *state = State::Pending(Some(observer)),
            State::Ready(outcome) => {
                drop(state);
                self.scheduler.enqueue(move || observer(outcome));
            }
            State::Pending(Some(_)) | State::Delivered => {
                unreachable!("task '{}' observed twice", self.name)
            }
        }
    }

    /// The completing capability was dropped. While an upstream failure is
    /// propagating the task fails with that error, otherwise it is abandoned.
    fn abandon(&self) {
        let err = self
            .scheduler
            .unwinding()
            .unwrap_or_else(|| TaskError::abandoned(&self.name));

        if self.complete(Err(err)) {
            tracing::debug!(task = %self.name, "completion capability dropped");
        }
    }
}

/// Handle to the eventual outcome of an asynchronous computation.
///
/// Every observing method consumes the handle: a task is observed once.
/// Dropping it discards the outcome without affecting the work in flight.
#[must_use = "a task does nothing observable unless it is chained or observed"]
pub struct Task<T: 'static> {
    shared: Rc<Shared<T>>,
}

impl<T: 'static> Task<T> {
    /// A task that already completed with `value`.
    pub fn ready(scheduler: &Scheduler, value: T) -> Self {
        Self::from_outcome(scheduler, Ok(value))
    }

    /// A task that already failed with `err`.
    pub fn failed(scheduler: &Scheduler, err: impl Into<TaskError>) -> Self {
        Self::from_outcome(scheduler, Err(err.into()))
    }

    pub fn from_outcome(scheduler: &Scheduler, outcome: Outcome<T>) -> Self {
        Self {
            shared: Shared::new(
                scheduler.clone(),
                Cow::Borrowed("ready"),
                State::Ready(outcome),
            ),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    /// Whether the outcome is already known.
    pub fn is_complete(&self) -> bool {
        matches!(*self.shared.state.borrow(), State::Ready(_))
    }

    /// Registers the single observer of this task's outcome.
    pub fn observe(self, observer: impl FnOnce(Outcome<T>) + 'static) {
        self.shared.observe(Box::new(observer));
        self.shared.scheduler.drain();
    }

    /// Runs `f` with the value once this task succeeds and continues with the
    /// task it returns. On failure `f` never runs and the error propagates to
    /// the returned task; frames captured by `f` fail with the same error.
    pub fn then<U, F>(self, f: F) -> Task<U>
    where
        U: 'static,
        F: FnOnce(T) -> Task<U> + 'static,
    {
        let scheduler = self.shared.scheduler.clone();
        let (frame, task) = scheduler.frame(self.shared.name.clone());

        self.observe(move |outcome| match outcome {
            Ok(value) => f(value).then_finish(frame),
            Err(err) => {
                scheduler.unwind(err.clone(), move || drop(f));
                frame.fail(err);
            }
        });

        task
    }

    /// Like [`Task::then`] for a synchronous continuation.
    pub fn map<U, F>(self, f: F) -> Task<U>
    where
        U: 'static,
        F: FnOnce(T) -> U + 'static,
    {
        let scheduler = self.shared.scheduler.clone();
        let (frame, task) = scheduler.frame(self.shared.name.clone());

        self.observe(move |outcome| match outcome {
            Ok(value) => frame.finish(f(value)),
            Err(err) => {
                scheduler.unwind(err.clone(), move || drop(f));
                frame.fail(err);
            }
        });

        task
    }

    /// Completes `frame` with whatever this task resolves to.
    pub fn then_finish(self, frame: Frame<T>) {
        self.observe(move |outcome| frame.complete(outcome));
    }
}

/// Producer side of a task. Completing or suspending consumes the frame, so a
/// task can never be completed twice.
pub struct Frame<T: 'static> {
    shared: Rc<Shared<T>>,
    armed: bool,
}

impl<T: 'static> Frame<T> {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    pub fn finish(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(self, err: impl Into<TaskError>) {
        self.complete(Err(err.into()));
    }

    pub fn complete(mut self, outcome: Outcome<T>) {
        self.armed = false;
        self.shared.complete(outcome);
        self.shared.scheduler.drain();
    }

    /// Parks the task until the returned continuation is resumed.
    pub fn suspend(mut self, tag: impl Into<Cow<'static, str>>) -> Continuation<T> {
        self.armed = false;
        let tag = tag.into();
        tracing::trace!(task = %self.shared.name, %tag, "suspended");

        Continuation {
            shared: self.shared.clone(),
            tag,
            armed: true,
        }
    }
}

impl<T: 'static> Drop for Frame<T> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.abandon();
        }
    }
}

/// One-shot capability resuming a suspended task.
pub struct Continuation<T: 'static> {
    shared: Rc<Shared<T>>,
    tag: Cow<'static, str>,
    armed: bool,
}

impl<T: 'static> Continuation<T> {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn schedule(self, value: T) {
        self.resume(Ok(value));
    }

    pub fn fail(self, err: impl Into<TaskError>) {
        self.resume(Err(err.into()));
    }

    pub fn resume(mut self, outcome: Outcome<T>) {
        self.armed = false;
        if !self.shared.complete(outcome) {
            tracing::debug!(task = %self.shared.name, tag = %self.tag, "task already completed, resume ignored");
        }
        self.shared.scheduler.drain();
    }

    /// Converts into a `Send` handle that another thread can resume. The
    /// outcome is delivered on this scheduler's thread by
    /// [`Scheduler::poll_remote`] or [`Scheduler::block_on`].
    pub fn into_remote(mut self) -> RemoteContinuation<T>
    where
        T: Send,
    {
        self.armed = false;
        let continuation = Continuation {
            shared: self.shared.clone(),
            tag: self.tag.clone(),
            armed: true,
        };
        self.shared.scheduler.park(continuation)
    }
}

impl<T: 'static> Drop for Continuation<T> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.abandon();
        }
    }
}

/// Handed to each iteration of [`Scheduler::loop_with_frame`]. Exactly one of
/// its methods decides how the loop goes on.
pub struct LoopFrame {
    frame: Frame<bool>,
}

impl LoopFrame {
    pub fn continue_loop(self) {
        self.frame.finish(true);
    }

    pub fn break_loop(self) {
        self.frame.finish(false);
    }

    pub fn fail(self, err: impl Into<TaskError>) {
        self.frame.fail(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn recorder<T: 'static>() -> (Rc<RefCell<Vec<T>>>, Rc<RefCell<Vec<T>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        (log.clone(), log)
    }

    #[test]
    fn test_then_runs_after_upstream_resolves() {
        let scheduler = Scheduler::new();
        let (frame, task) = scheduler.frame::<u32>("upstream");
        let continuation = frame.suspend("external");

        let ran = Rc::new(Cell::new(0));
        let counter = ran.clone();
        let sched = scheduler.clone();
        let chained = task.then(move |value| {
            counter.set(counter.get() + 1);
            Task::ready(&sched, value + 1)
        });

        assert_eq!(ran.get(), 0);
        continuation.schedule(1);
        assert_eq!(ran.get(), 1);
        assert_eq!(scheduler.block_on(chained).unwrap(), 2);
        assert_eq!(ran.get(), 1);
    }

    #[test]
    fn test_failure_skips_then_and_propagates() {
        let scheduler = Scheduler::new();
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();

        let sched = scheduler.clone();
        let task = Task::<u32>::failed(&scheduler, TaskError::msg("transport"))
            .then(move |value| {
                flag.set(true);
                Task::ready(&sched, value)
            })
            .map(|value| value * 2);

        let err = scheduler.block_on(task).unwrap_err();
        assert!(!ran.get());
        assert_eq!(err.to_string(), "transport");
    }

    #[test]
    fn test_captured_frame_fails_with_upstream_error() {
        let scheduler = Scheduler::new();
        let (outer, outer_task) = scheduler.frame::<u32>("outer");

        let _ = Task::<u32>::failed(&scheduler, TaskError::msg("parse"))
            .map(move |value| outer.finish(value));

        let err = scheduler.block_on(outer_task).unwrap_err();
        assert_eq!(err.to_string(), "parse");
    }

    #[test]
    fn test_dropped_frame_abandons_task() {
        let scheduler = Scheduler::new();
        let (frame, task) = scheduler.frame::<()>("forgotten");
        drop(frame);

        let err = scheduler.block_on(task).unwrap_err();
        assert!(matches!(
            err,
            crate::ShioriError::Task(TaskError::Abandoned(ref name)) if *name == "forgotten"
        ));
    }

    #[test]
    fn test_dropped_continuation_abandons_task() {
        let scheduler = Scheduler::new();
        let (frame, task) = scheduler.frame::<()>("suspended");
        let continuation = frame.suspend("never");
        drop(continuation);

        assert!(scheduler.block_on(task).is_err());
    }

    #[test]
    fn test_independent_chains_keep_registration_order() {
        let scheduler = Scheduler::new();
        let (log, seen) = recorder();

        let (first, first_task) = scheduler.frame::<&'static str>("first");
        let (second, second_task) = scheduler.frame::<&'static str>("second");
        let first = first.suspend("a");
        let second = second.suspend("b");

        let l = log.clone();
        first_task.observe(move |outcome| l.borrow_mut().push(outcome.unwrap()));
        let l = log.clone();
        second_task.observe(move |outcome| l.borrow_mut().push(outcome.unwrap()));

        // Resumed inside one job, both deliveries are queued in resume order.
        let sched = scheduler.clone();
        scheduler.run(move || {
            first.schedule("a");
            second.schedule("b");
            Task::ready(&sched, ())
        });

        assert_eq!(*seen.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn test_loop_with_frame_counts_iterations() {
        let scheduler = Scheduler::new();
        let count = Rc::new(Cell::new(0));
        let counter = count.clone();

        let task = scheduler.loop_with_frame("count", move |frame| {
            counter.set(counter.get() + 1);
            if counter.get() < 5 {
                frame.continue_loop();
            } else {
                frame.break_loop();
            }
        });

        scheduler.block_on(task).unwrap();
        assert_eq!(count.get(), 5);
    }

    #[test]
    fn test_long_synchronous_loop_does_not_grow_stack() {
        let scheduler = Scheduler::new();
        let count = Rc::new(Cell::new(0u32));
        let counter = count.clone();

        let task = scheduler.loop_with_frame("spin", move |frame| {
            counter.set(counter.get() + 1);
            if counter.get() < 200_000 {
                frame.continue_loop();
            } else {
                frame.break_loop();
            }
        });

        scheduler.block_on(task).unwrap();
        assert_eq!(count.get(), 200_000);
    }

    #[test]
    fn test_loop_iteration_may_suspend() {
        let scheduler = Scheduler::new();
        let parked: Rc<RefCell<Option<Continuation<()>>>> = Rc::default();
        let iterations = Rc::new(Cell::new(0));

        let slot = parked.clone();
        let counter = iterations.clone();
        let sched = scheduler.clone();
        let task = scheduler.loop_with_frame("waiting", move |frame| {
            counter.set(counter.get() + 1);
            if counter.get() == 3 {
                frame.break_loop();
                return;
            }
            let (wait, wait_task) = sched.frame::<()>("wait");
            *slot.borrow_mut() = Some(wait.suspend("kick"));
            wait_task.observe(move |_| frame.continue_loop());
        });

        assert_eq!(iterations.get(), 1);
        assert!(!task.is_complete());

        for expected in [2, 3] {
            let continuation = parked.borrow_mut().take().unwrap();
            continuation.schedule(());
            assert_eq!(iterations.get(), expected);
        }

        assert!(task.is_complete());
    }

    #[test]
    fn test_handle_catches_chain_error() {
        let scheduler = Scheduler::new();
        let caught = Rc::new(Cell::new(0));
        let counter = caught.clone();

        let sched = scheduler.clone();
        let task = scheduler.handle(
            "guarded",
            move |frame| {
                Task::<bool>::failed(&sched, TaskError::msg("handler failed")).then_finish(frame);
                Ok(())
            },
            move |frame, err| {
                counter.set(counter.get() + 1);
                assert_eq!(err.to_string(), "handler failed");
                frame.finish(false);
            },
        );

        assert!(!scheduler.block_on(task).unwrap());
        assert_eq!(caught.get(), 1);
    }

    #[test]
    fn test_handle_catches_body_error_once() {
        let scheduler = Scheduler::new();
        let caught = Rc::new(Cell::new(0));
        let counter = caught.clone();

        let task = scheduler.handle(
            "early return",
            |_frame: Frame<u32>| Err(anyhow::anyhow!("bad parameters")),
            move |frame, err| {
                counter.set(counter.get() + 1);
                assert_eq!(err.to_string(), "bad parameters");
                frame.finish(0);
            },
        );

        assert_eq!(scheduler.block_on(task).unwrap(), 0);
        scheduler.drain();
        assert_eq!(caught.get(), 1);
    }

    #[test]
    fn test_handle_passes_success_through() {
        let scheduler = Scheduler::new();
        let task = scheduler.handle(
            "fine",
            |frame| {
                frame.finish(7);
                Ok(())
            },
            |_frame, _err| unreachable!(),
        );

        assert_eq!(scheduler.block_on(task).unwrap(), 7);
    }
}
