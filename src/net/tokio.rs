use std::thread;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::error::{FetchError, ShioriError};
use crate::net::file::{into_response, outside_root, resolve};
use crate::net::{Body, Method, RawFetch, Request, Response};
use crate::task::{RemoteContinuation, Scheduler, Task};

struct Job {
    request: Request,
    reply: RemoteContinuation<Response>,
}

/// Reads files on a background thread driven by a single-threaded tokio
/// runtime. Outcomes come back through remote continuations, so the
/// scheduler has to be driven with [`Scheduler::block_on`] or
/// [`Scheduler::poll_remote`].
pub struct TokioFetch {
    root: Utf8PathBuf,
    sender: Option<UnboundedSender<Job>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl TokioFetch {
    pub fn spawn(root: impl Into<Utf8PathBuf>) -> Result<Self, ShioriError> {
        let root = root.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        let worker_root = root.clone();
        let worker = thread::Builder::new()
            .name("shiori-fetch".into())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(job) = receiver.recv().await {
                        let root = worker_root.clone();
                        tokio::spawn(async move {
                            let response = read(&root, job.request).await;
                            job.reply.schedule(response);
                        });
                    }
                });
            })?;

        tracing::debug!(%root, "fetch worker started");

        Ok(Self {
            root,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }
}

async fn read(root: &Utf8Path, request: Request) -> Response {
    if request.method == Method::Post {
        return Response::new(request.url, 405, Body::Empty);
    }

    let Some(path) = resolve(root, &request.url) else {
        return outside_root(request.url);
    };
    tracing::debug!(%path, "reading file");
    into_response(request.url, request.binary, tokio::fs::read(&path).await)
}

impl RawFetch for TokioFetch {
    fn fetch(&self, scheduler: &Scheduler, request: Request) -> Task<Response> {
        let Some(sender) = &self.sender else {
            return Task::failed(scheduler, FetchError::WorkerGone);
        };

        let (frame, task) = scheduler.frame(format!("read {}", request.url));
        let reply = frame.suspend("fetch worker").into_remote();

        if let Err(mpsc::error::SendError(job)) = sender.send(Job { request, reply }) {
            job.reply.fail(FetchError::WorkerGone);
            scheduler.poll_remote();
        }

        task
    }
}

impl Drop for TokioFetch {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("fetch worker panicked");
            }
        }
    }
}
