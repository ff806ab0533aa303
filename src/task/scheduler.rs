use std::any::Any;
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, Sender};

use crate::error::{ShioriError, TaskError, report_unhandled};
use crate::task::{Continuation, Frame, LoopFrame, Shared, State, Task};

type Job = Box<dyn FnOnce()>;
type Parked = Box<dyn FnOnce(Box<dyn Any + Send>)>;
type Listener = Rc<dyn Fn(&TaskError)>;

/// A remote outcome travelling back to the scheduler thread.
struct Wakeup {
    id: u64,
    outcome: Box<dyn Any + Send>,
}

struct Inner {
    ready: RefCell<VecDeque<Job>>,
    draining: Cell<bool>,
    /// Error propagating through `Task::then` while dead closures are dropped.
    unwinding: RefCell<Option<TaskError>>,
    parked: RefCell<HashMap<u64, Parked>>,
    next_id: Cell<u64>,
    sender: Sender<Wakeup>,
    receiver: Receiver<Wakeup>,
    listener: RefCell<Option<Listener>>,
}

/// Single-threaded FIFO executor for [`Task`] completions.
///
/// Completions are queued, never delivered inline. The queue is drained by
/// the outermost entry point, so every user callback runs with a shallow
/// stack no matter how long a chain of ready tasks grows. Cloning yields
/// another handle to the same queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();

        Self {
            inner: Rc::new(Inner {
                ready: RefCell::new(VecDeque::new()),
                draining: Cell::new(false),
                unwinding: RefCell::new(None),
                parked: RefCell::new(HashMap::new()),
                next_id: Cell::new(0),
                sender,
                receiver,
                listener: RefCell::new(None),
            }),
        }
    }

    /// Creates a pending task together with the frame that completes it.
    pub fn frame<T: 'static>(&self, name: impl Into<Cow<'static, str>>) -> (Frame<T>, Task<T>) {
        let shared = Shared::new(self.clone(), name.into(), State::Pending(None));
        let frame = Frame {
            shared: shared.clone(),
            armed: true,
        };
        (frame, Task { shared })
    }

    /// Listener for errors reaching the root of [`Scheduler::run`] or raised
    /// by panicking jobs on this scheduler. The process-wide hook installed
    /// with [`set_unhandled_hook`](crate::set_unhandled_hook) is called too.
    pub fn on_unhandled(&self, listener: impl Fn(&TaskError) + 'static) {
        self.inner.listener.replace(Some(Rc::new(listener)));
    }

    pub(crate) fn report(&self, err: &TaskError) {
        report_unhandled(err);
        let listener = self.inner.listener.borrow().clone();
        if let Some(listener) = listener {
            listener(err);
        }
    }

    /// Entry point from synchronous code. Starts the task built by `factory`
    /// on the queue and drains. A failure of the root task is reported as
    /// unhandled.
    pub fn run<T: 'static>(&self, factory: impl FnOnce() -> Task<T> + 'static) {
        let scheduler = self.clone();
        self.enqueue(move || {
            factory().observe(move |outcome| {
                if let Err(err) = outcome {
                    scheduler.report(&err);
                }
            });
        });
        self.drain();
    }

    pub(crate) fn enqueue(&self, job: impl FnOnce() + 'static) {
        self.inner.ready.borrow_mut().push_back(Box::new(job));
    }

    /// Runs queued work until the queue is empty. Called from inside a
    /// running job it returns immediately; the outer drain picks the work up.
    pub fn drain(&self) {
        if self.inner.draining.replace(true) {
            return;
        }
        let _guard = DrainGuard(&self.inner.draining);

        loop {
            let job = self.inner.ready.borrow_mut().pop_front();
            let Some(job) = job else { break };

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                self.report(&TaskError::panicked(payload));
            }
        }
    }

    /// Number of jobs waiting in the ready queue.
    pub fn pending_jobs(&self) -> usize {
        self.inner.ready.borrow().len()
    }

    /// Number of remote continuations not yet resumed.
    pub fn pending_remote(&self) -> usize {
        self.inner.parked.borrow().len()
    }

    /// Runs `f` while `err` is the error failing abandoned frames.
    pub(crate) fn unwind(&self, err: TaskError, f: impl FnOnce()) {
        let previous = self.inner.unwinding.replace(Some(err));
        let _guard = UnwindGuard {
            slot: &self.inner.unwinding,
            previous,
        };
        f();
    }

    pub(crate) fn unwinding(&self) -> Option<TaskError> {
        self.inner.unwinding.borrow().clone()
    }

    /// Runs `body` against a fresh frame. Any failure of that frame, and any
    /// error returned or panic raised by `body` itself, is routed to
    /// `on_error` together with the frame of the returned task. At most one of
    /// the paths settles the returned task.
    pub fn handle<T, B, E>(&self, name: impl Into<Cow<'static, str>>, body: B, on_error: E) -> Task<T>
    where
        T: 'static,
        B: FnOnce(Frame<T>) -> anyhow::Result<()>,
        E: FnOnce(Frame<T>, TaskError) + 'static,
    {
        let name = name.into();
        let (outer, task) = self.frame(name.clone());
        let (inner, inner_task) = self.frame(name);
        let boundary = Rc::new(RefCell::new(Some((outer, on_error))));

        inner_task.observe({
            let boundary = boundary.clone();
            move |outcome| settle(&boundary, outcome)
        });

        match panic::catch_unwind(AssertUnwindSafe(|| body(inner))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => settle(&boundary, Err(err.into())),
            Err(payload) => settle(&boundary, Err(TaskError::panicked(payload))),
        }

        task
    }

    /// Repeatedly runs `body`, each time with a new [`LoopFrame`]. An
    /// iteration may suspend; the next one starts only after the frame is
    /// continued. The first iteration runs from the queue.
    pub fn loop_with_frame<F>(&self, name: impl Into<Cow<'static, str>>, body: F) -> Task<()>
    where
        F: FnMut(LoopFrame) + 'static,
    {
        let name = name.into();
        let (done, task) = self.frame(name.clone());
        let body: Rc<RefCell<dyn FnMut(LoopFrame)>> = Rc::new(RefCell::new(body));

        let scheduler = self.clone();
        self.enqueue(move || scheduler.iterate(name, body, done));
        self.drain();

        task
    }

    fn iterate(&self, name: Cow<'static, str>, body: Rc<RefCell<dyn FnMut(LoopFrame)>>, done: Frame<()>) {
        let (step, step_task) = self.frame::<bool>(name.clone());
        {
            let mut body = body.borrow_mut();
            (&mut *body)(LoopFrame { frame: step });
        }

        let scheduler = self.clone();
        step_task.observe(move |outcome| match outcome {
            Ok(true) => scheduler.iterate(name, body, done),
            Ok(false) => done.finish(()),
            Err(err) => done.fail(err),
        });
    }

    pub(crate) fn park<T: Send + 'static>(&self, continuation: Continuation<T>) -> RemoteContinuation<T> {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        let tag = continuation.tag.clone();

        self.inner.parked.borrow_mut().insert(
            id,
            Box::new(move |payload: Box<dyn Any + Send>| {
                match payload.downcast::<Result<T, TaskError>>() {
                    Ok(outcome) => continuation.resume(*outcome),
                    Err(_) => continuation.fail(TaskError::msg("remote outcome has the wrong type")),
                }
            }),
        );

        RemoteContinuation {
            id,
            tag,
            sender: Some(self.inner.sender.clone()),
            _marker: PhantomData,
        }
    }

    fn deliver(&self, wakeup: Wakeup) {
        let parked = self.inner.parked.borrow_mut().remove(&wakeup.id);
        match parked {
            Some(resume) => resume(wakeup.outcome),
            None => tracing::debug!(id = wakeup.id, "wake-up for an unknown continuation"),
        }
    }

    /// Delivers every remote outcome received so far, then drains. Returns
    /// the number of outcomes delivered.
    pub fn poll_remote(&self) -> usize {
        let mut delivered = 0;
        while let Ok(wakeup) = self.inner.receiver.try_recv() {
            self.deliver(wakeup);
            delivered += 1;
        }
        self.drain();
        delivered
    }

    /// Drives the scheduler until `task` completes, sleeping on remote
    /// wake-ups while nothing is runnable.
    pub fn block_on<T: 'static>(&self, task: Task<T>) -> Result<T, ShioriError> {
        if self.inner.draining.get() {
            return Err(ShioriError::Reentrant);
        }

        let name = task.name().to_string();
        let slot = Rc::new(RefCell::new(None));
        task.observe({
            let slot = slot.clone();
            move |outcome| *slot.borrow_mut() = Some(outcome)
        });

        loop {
            self.drain();

            let outcome = slot.borrow_mut().take();
            if let Some(outcome) = outcome {
                return Ok(outcome?);
            }

            if self.inner.parked.borrow().is_empty() {
                return Err(ShioriError::Stalled(name));
            }

            match self.inner.receiver.recv() {
                Ok(wakeup) => self.deliver(wakeup),
                Err(_) => return Err(ShioriError::Stalled(name)),
            }
        }
    }
}

fn settle<T, E>(boundary: &RefCell<Option<(Frame<T>, E)>>, outcome: Result<T, TaskError>)
where
    T: 'static,
    E: FnOnce(Frame<T>, TaskError),
{
    let Some((outer, on_error)) = boundary.borrow_mut().take() else {
        return;
    };

    match outcome {
        Ok(value) => outer.finish(value),
        Err(err) => {
            tracing::debug!(task = %outer.name(), error = %err, "error caught at handle boundary");
            on_error(outer, err);
        }
    }
}

/// Puts the previous unwinding error back, even if dropping a closure panics.
struct UnwindGuard<'a> {
    slot: &'a RefCell<Option<TaskError>>,
    previous: Option<TaskError>,
}

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        self.slot.replace(self.previous.take());
    }
}

struct DrainGuard<'a>(&'a Cell<bool>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// A [`Continuation`] that may be resumed from any thread.
///
/// Dropping it without resuming fails the task as abandoned.
pub struct RemoteContinuation<T: Send + 'static> {
    id: u64,
    tag: Cow<'static, str>,
    sender: Option<Sender<Wakeup>>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + 'static> RemoteContinuation<T> {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn schedule(mut self, value: T) {
        self.send(Ok(value));
    }

    pub fn fail(mut self, err: impl Into<TaskError>) {
        self.send(Err(err.into()));
    }

    pub fn resume(mut self, outcome: Result<T, TaskError>) {
        self.send(outcome);
    }

    fn send(&mut self, outcome: Result<T, TaskError>) {
        let Some(sender) = self.sender.take() else {
            return;
        };

        let wakeup = Wakeup {
            id: self.id,
            outcome: Box::new(outcome),
        };
        if sender.send(wakeup).is_err() {
            tracing::debug!(tag = %self.tag, "scheduler is gone, remote outcome dropped");
        }
    }
}

impl<T: Send + 'static> Drop for RemoteContinuation<T> {
    fn drop(&mut self) {
        if self.sender.is_some() {
            let err = TaskError::Abandoned(self.tag.clone());
            self.send(Err(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_jobs_run_in_fifo_order() {
        let scheduler = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        for i in 0..5 {
            let log = log.clone();
            scheduler.enqueue(move || log.borrow_mut().push(i));
        }
        assert_eq!(scheduler.pending_jobs(), 5);

        scheduler.drain();
        assert_eq!(*log.borrow(), vec![0, 1, 2, 3, 4]);
        assert_eq!(scheduler.pending_jobs(), 0);
    }

    #[test]
    fn test_run_reports_root_failure() {
        let scheduler = Scheduler::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let log = seen.clone();
        scheduler.on_unhandled(move |err| log.borrow_mut().push(err.to_string()));

        let sched = scheduler.clone();
        scheduler.run(move || Task::<()>::failed(&sched, TaskError::msg("nobody caught me")));

        assert_eq!(*seen.borrow(), vec!["nobody caught me".to_string()]);
    }

    #[test]
    fn test_panicking_job_is_reported_and_queue_survives() {
        let scheduler = Scheduler::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let after = Rc::new(Cell::new(false));

        let log = seen.clone();
        scheduler.on_unhandled(move |err| log.borrow_mut().push(err.clone()));

        scheduler.enqueue(|| panic!("job exploded"));
        let flag = after.clone();
        scheduler.enqueue(move || flag.set(true));
        scheduler.drain();

        assert!(after.get());
        assert!(matches!(seen.borrow().as_slice(), [TaskError::Panicked(msg)] if msg == "job exploded"));
    }

    #[test]
    fn test_handle_catches_panicking_body() {
        let scheduler = Scheduler::new();
        let caught = Rc::new(RefCell::new(Vec::new()));

        let log = caught.clone();
        let task = scheduler.handle(
            "explosive",
            |_frame: Frame<u8>| -> anyhow::Result<()> { panic!("body exploded") },
            move |frame, err| {
                log.borrow_mut().push(err.to_string());
                frame.finish(0);
            },
        );

        assert_eq!(scheduler.block_on(task).unwrap(), 0);
        assert_eq!(*caught.borrow(), vec!["Task panicked: body exploded".to_string()]);
    }

    #[test]
    fn test_unwinding_error_is_restored_after_panic() {
        let scheduler = Scheduler::new();
        let outer = TaskError::msg("outer");

        let sched = scheduler.clone();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            sched.unwind(outer.clone(), || {
                sched.unwind(TaskError::msg("inner"), || panic!("drop exploded"));
            });
        }));
        assert!(result.is_err());
        assert!(scheduler.unwinding().is_none());

        scheduler.unwind(outer, || {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| {
                scheduler.unwind(TaskError::msg("inner"), || panic!("drop exploded"));
            }));
            let current = scheduler.unwinding().map(|err| err.to_string());
            assert_eq!(current.as_deref(), Some("outer"));
        });

        let (frame, task) = scheduler.frame::<u8>("later");
        drop(frame);
        let err = scheduler.block_on(task).unwrap_err();
        assert!(matches!(err, ShioriError::Task(TaskError::Abandoned(_))));
    }

    #[test]
    fn test_block_on_remote_continuation() {
        let scheduler = Scheduler::new();
        let (frame, task) = scheduler.frame::<String>("remote");
        let remote = frame.suspend("worker").into_remote();

        let worker = thread::spawn(move || remote.schedule("from worker".to_string()));

        let value = scheduler.block_on(task.map(|s| s.len())).unwrap();
        assert_eq!(value, "from worker".len());
        worker.join().unwrap();
        assert_eq!(scheduler.pending_remote(), 0);
    }

    #[test]
    fn test_dropped_remote_continuation_fails_task() {
        let scheduler = Scheduler::new();
        let (frame, task) = scheduler.frame::<u8>("remote");
        let remote = frame.suspend("dropped").into_remote();

        thread::spawn(move || drop(remote)).join().unwrap();

        let err = scheduler.block_on(task).unwrap_err();
        assert!(matches!(err, ShioriError::Task(TaskError::Abandoned(_))));
    }

    #[test]
    fn test_poll_remote_delivers_pending_outcomes() {
        let scheduler = Scheduler::new();
        let (frame, task) = scheduler.frame::<u8>("polled");
        let remote = frame.suspend("worker").into_remote();

        let got = Rc::new(Cell::new(None));
        let slot = got.clone();
        task.observe(move |outcome| slot.set(outcome.ok()));

        assert_eq!(scheduler.poll_remote(), 0);
        thread::spawn(move || remote.schedule(9)).join().unwrap();
        assert_eq!(scheduler.poll_remote(), 1);
        assert_eq!(got.get(), Some(9));
    }

    #[test]
    fn test_block_on_reports_stall() {
        let scheduler = Scheduler::new();
        let (frame, task) = scheduler.frame::<()>("stuck");
        let _continuation = frame.suspend("never resumed");

        let err = scheduler.block_on(task).unwrap_err();
        assert!(matches!(err, ShioriError::Stalled(ref name) if name == "stuck"));
    }

    #[test]
    fn test_block_on_inside_job_is_rejected() {
        let scheduler = Scheduler::new();
        let result = Rc::new(RefCell::new(None));

        let sched = scheduler.clone();
        let slot = result.clone();
        scheduler.enqueue(move || {
            let task = Task::ready(&sched, ());
            *slot.borrow_mut() = Some(sched.block_on(task));
        });
        scheduler.drain();

        assert!(matches!(*result.borrow(), Some(Err(ShioriError::Reentrant))));
    }
}
