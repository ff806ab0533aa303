#![forbid(unsafe_code)]
//! Runtime pieces of an embeddable document viewer.
//!
//! - [`task`] is a single-threaded cooperative scheduler. Tasks complete
//!   through a ready queue, so deep chains of continuations never grow the
//!   stack, and errors propagate through chains and loops to a handler.
//! - [`net`] loads resources over a pluggable transport. Concurrent requests
//!   for the same URL share one fetch and parsed results are cached.
//! - [`viewer`] runs the command loop: commands from the embedder are taken
//!   one at a time, re-layout requests are serviced first, and results are
//!   reported back as JSON notifications.
//!
//! Everything runs on the thread owning the [`Scheduler`]. Blocking work can
//! be moved elsewhere and handed back with a [`RemoteContinuation`].

pub mod error;
pub mod net;
pub mod task;
pub mod utils;
pub mod viewer;

pub use crate::error::*;
pub use crate::task::{Continuation, Fetcher, Frame, RemoteContinuation, Scheduler, Task};
pub use crate::viewer::{Notification, PageProvider, Viewer};
