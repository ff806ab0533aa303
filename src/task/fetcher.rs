use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::task::{Continuation, Outcome, Scheduler, Task};

enum FetcherState<T: 'static> {
    Idle(Box<dyn FnOnce() -> Task<T>>),
    InFlight,
    Done(Outcome<T>),
}

struct FetcherInner<T: 'static> {
    name: Cow<'static, str>,
    scheduler: Scheduler,
    state: RefCell<FetcherState<T>>,
    waiters: RefCell<Vec<Continuation<T>>>,
}

/// Runs a task at most once and shares its outcome with every interested
/// party, including those that arrive after it finished.
pub struct Fetcher<T: Clone + 'static> {
    inner: Rc<FetcherInner<T>>,
}

impl<T: Clone + 'static> Clone for Fetcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> Fetcher<T> {
    pub fn new(
        scheduler: &Scheduler,
        name: impl Into<Cow<'static, str>>,
        factory: impl FnOnce() -> Task<T> + 'static,
    ) -> Self {
        Self {
            inner: Rc::new(FetcherInner {
                name: name.into(),
                scheduler: scheduler.clone(),
                state: RefCell::new(FetcherState::Idle(Box::new(factory))),
                waiters: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Invokes the factory on the scheduler. Only the first call has an
    /// effect.
    pub fn start(&self) {
        let factory = {
            let mut state = self.inner.state.borrow_mut();
            match std::mem::replace(&mut *state, FetcherState::InFlight) {
                FetcherState::Idle(factory) => factory,
                other => {
                    *state = other;
                    return;
                }
            }
        };

        tracing::debug!(fetcher = %self.inner.name, "started");

        let inner = self.inner.clone();
        let scheduler = &self.inner.scheduler;
        scheduler.enqueue(move || {
            factory().observe(move |outcome| inner.settle(outcome));
        });
        scheduler.drain();
    }

    /// The shared outcome. Does not start the fetcher.
    pub fn get(&self) -> Task<T> {
        let outcome = match &*self.inner.state.borrow() {
            FetcherState::Done(outcome) => Some(outcome.clone()),
            _ => None,
        };
        if let Some(outcome) = outcome {
            return Task::from_outcome(&self.inner.scheduler, outcome);
        }

        let (frame, task) = self.inner.scheduler.frame(self.inner.name.clone());
        self.inner.waiters.borrow_mut().push(frame.suspend("fetcher"));
        task
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.inner.state.borrow(), FetcherState::Done(_))
    }
}

impl<T: Clone + 'static> FetcherInner<T> {
    fn settle(&self, outcome: Outcome<T>) {
        if let Err(err) = &outcome {
            tracing::debug!(fetcher = %self.name, error = %err, "failed");
        }

        self.state.replace(FetcherState::Done(outcome.clone()));
        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        for waiter in waiters {
            waiter.resume(outcome.clone());
        }
    }
}

impl<T: Clone + 'static> fmt::Debug for Fetcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.inner.state.borrow() {
            FetcherState::Idle(_) => "idle",
            FetcherState::InFlight => "in flight",
            FetcherState::Done(Ok(_)) => "done",
            FetcherState::Done(Err(_)) => "failed",
        };
        f.debug_struct("Fetcher")
            .field("name", &self.inner.name)
            .field("state", &state)
            .finish()
    }
}

/// Starts every fetcher and completes once all of them have finished.
/// Individual failures are ignored.
pub fn wait_for_fetchers<T: Clone + 'static>(scheduler: &Scheduler, fetchers: &[Fetcher<T>]) -> Task<()> {
    if fetchers.is_empty() {
        return Task::ready(scheduler, ());
    }

    let (frame, task) = scheduler.frame("waitForFetchers");
    let frame = Rc::new(RefCell::new(Some(frame)));
    let remaining = Rc::new(Cell::new(fetchers.len()));

    for fetcher in fetchers {
        fetcher.start();

        let frame = frame.clone();
        let remaining = remaining.clone();
        let name = fetcher.inner.name.clone();
        fetcher.get().observe(move |outcome| {
            if let Err(err) = outcome {
                tracing::debug!(fetcher = %name, error = %err, "ignoring failed fetcher");
            }

            remaining.set(remaining.get() - 1);
            if remaining.get() == 0 {
                let frame = frame.borrow_mut().take();
                if let Some(frame) = frame {
                    frame.finish(());
                }
            }
        });
    }

    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;

    fn counting_fetcher(scheduler: &Scheduler, calls: &Rc<Cell<u32>>) -> (Fetcher<u32>, Rc<RefCell<Option<Continuation<u32>>>>) {
        let parked = Rc::new(RefCell::new(None));
        let slot = parked.clone();
        let calls = calls.clone();
        let sched = scheduler.clone();

        let fetcher = Fetcher::new(scheduler, "counting", move || {
            calls.set(calls.get() + 1);
            let (frame, task) = sched.frame("load");
            *slot.borrow_mut() = Some(frame.suspend("io"));
            task
        });

        (fetcher, parked)
    }

    #[test]
    fn test_factory_runs_once() {
        let scheduler = Scheduler::new();
        let calls = Rc::new(Cell::new(0));
        let (fetcher, parked) = counting_fetcher(&scheduler, &calls);

        fetcher.start();
        fetcher.start();
        fetcher.clone().start();
        assert_eq!(calls.get(), 1);
        assert!(!fetcher.is_done());

        let early = fetcher.get();
        parked.borrow_mut().take().unwrap().schedule(5);
        assert!(fetcher.is_done());

        let late = fetcher.get();
        assert!(late.is_complete());
        assert_eq!(scheduler.block_on(early).unwrap(), 5);
        assert_eq!(scheduler.block_on(late).unwrap(), 5);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_waiter_attached_before_start() {
        let scheduler = Scheduler::new();
        let calls = Rc::new(Cell::new(0));
        let (fetcher, parked) = counting_fetcher(&scheduler, &calls);

        let got = Rc::new(Cell::new(None));
        let slot = got.clone();
        fetcher.get().observe(move |outcome| slot.set(outcome.ok()));

        assert_eq!(calls.get(), 0);
        assert!(parked.borrow().is_none());
        assert_eq!(got.get(), None);

        fetcher.start();
        assert_eq!(calls.get(), 1);
        assert_eq!(got.get(), None);

        parked.borrow_mut().take().unwrap().schedule(7);
        assert_eq!(got.get(), Some(7));
        assert!(fetcher.is_done());
    }

    #[test]
    fn test_every_waiter_sees_failure() {
        let scheduler = Scheduler::new();
        let calls = Rc::new(Cell::new(0));
        let (fetcher, parked) = counting_fetcher(&scheduler, &calls);

        fetcher.start();
        let waiters: Vec<_> = (0..3).map(|_| fetcher.get()).collect();
        parked.borrow_mut().take().unwrap().fail(TaskError::msg("offline"));

        for waiter in waiters {
            let err = scheduler.block_on(waiter).unwrap_err();
            assert_eq!(err.to_string(), "offline");
        }
        assert!(scheduler.block_on(fetcher.get()).is_err());
    }

    #[test]
    fn test_wait_for_fetchers_ignores_failures() {
        let scheduler = Scheduler::new();
        let sched = scheduler.clone();
        let ok = Fetcher::new(&scheduler, "ok", move || Task::ready(&sched, ()));
        let sched = scheduler.clone();
        let bad = Fetcher::new(&scheduler, "bad", move || Task::failed(&sched, TaskError::msg("nope")));

        let task = wait_for_fetchers(&scheduler, &[ok.clone(), bad.clone()]);
        scheduler.block_on(task).unwrap();
        assert!(ok.is_done());
        assert!(bad.is_done());
    }

    #[test]
    fn test_wait_for_fetchers_waits_for_slowest() {
        let scheduler = Scheduler::new();
        let calls = Rc::new(Cell::new(0));
        let (slow, parked) = counting_fetcher(&scheduler, &calls);

        let task = wait_for_fetchers(&scheduler, &[slow]);
        assert!(!task.is_complete());

        parked.borrow_mut().take().unwrap().schedule(1);
        assert!(task.is_complete());
    }

    #[test]
    fn test_wait_for_no_fetchers() {
        let scheduler = Scheduler::new();
        let task = wait_for_fetchers::<()>(&scheduler, &[]);
        assert!(task.is_complete());
    }
}
