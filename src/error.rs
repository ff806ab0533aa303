use std::borrow::Cow;
use std::fmt::{Debug, Display};
use std::sync::{Arc, RwLock};

use thiserror::Error;

/// The failure carried by a [`Task`](crate::task::Task).
///
/// Task outcomes are handed to every observer of a [`Fetcher`](crate::task::Fetcher),
/// so the error has to be cheap to clone; the underlying cause is shared.
#[derive(Debug, Error, Clone)]
pub enum TaskError {
    #[error(transparent)]
    Failed(Arc<anyhow::Error>),

    #[error("Task '{0}' was abandoned before it completed")]
    Abandoned(Cow<'static, str>),

    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(Arc::new(err.into()))
    }

    pub fn msg(message: impl Display + Debug + Send + Sync + 'static) -> Self {
        Self::Failed(Arc::new(anyhow::Error::msg(message)))
    }

    pub(crate) fn abandoned(name: &Cow<'static, str>) -> Self {
        Self::Abandoned(name.clone())
    }

    pub(crate) fn panicked(payload: Box<dyn std::any::Any + Send>) -> Self {
        if let Some(s) = payload.downcast_ref::<&str>() {
            Self::Panicked(s.to_string())
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Self::Panicked(s.clone())
        } else {
            Self::Panicked(String::from("unknown payload"))
        }
    }

    /// Returns the underlying cause if it is of type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Display + Debug + Send + Sync + 'static,
    {
        match self {
            Self::Failed(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(Arc::new(err))
    }
}

impl From<FetchError> for TaskError {
    fn from(err: FetchError) -> Self {
        Self::new(err)
    }
}

impl From<CommandError> for TaskError {
    fn from(err: CommandError) -> Self {
        Self::new(err)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request for '{url}' failed with status {status}")]
    Status { url: String, status: u16 },

    #[error("Malformed JSON resource '{url}'.\n{source}")]
    Json {
        url: String,
        source: serde_json::Error,
    },

    #[error("Fetch worker is no longer running")]
    WorkerGone,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("No such action")]
    UnknownAction(String),

    #[error("Malformed parameters for '{action}'.\n{source}")]
    Params {
        action: &'static str,
        source: serde_json::Error,
    },

    #[error("Command is not valid JSON.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("No document is loaded")]
    NoDocument,
}

#[derive(Debug, Error)]
pub enum ShioriError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Task '{0}' cannot make progress: nothing is queued and no remote continuation is pending")]
    Stalled(String),

    #[error("Scheduler::block_on called while the scheduler is draining")]
    Reentrant,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type UnhandledHook = Arc<dyn Fn(&TaskError) + Send + Sync>;

static UNHANDLED: RwLock<Option<UnhandledHook>> = RwLock::new(None);

/// Installs the process-wide listener for errors that escaped every
/// [`handle`](crate::task::Scheduler::handle) boundary. Returns the previous
/// listener, if any.
pub fn set_unhandled_hook(
    hook: impl Fn(&TaskError) + Send + Sync + 'static,
) -> Option<Arc<dyn Fn(&TaskError) + Send + Sync>> {
    match UNHANDLED.write() {
        Ok(mut slot) => slot.replace(Arc::new(hook)),
        Err(poisoned) => poisoned.into_inner().replace(Arc::new(hook)),
    }
}

pub(crate) fn report_unhandled(err: &TaskError) {
    tracing::error!(error = %err, "unhandled task error");

    let hook = match UNHANDLED.read() {
        Ok(slot) => slot.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };

    if let Some(hook) = hook {
        hook(err);
    }
}
