//! Resource fetching and caching.
//!
//! [`RawFetch`] is the transport seam: it turns a [`Request`] into a
//! [`Response`] task. [`ResourceStore`] sits on top and makes sure each URL is
//! fetched and parsed once, no matter how many callers ask for it while the
//! request is in flight.
mod file;
mod json;
#[cfg(feature = "tokio")]
mod tokio;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub use crate::net::file::FileFetch;
pub use crate::net::json::{JsonStore, parse_json};
#[cfg(feature = "tokio")]
pub use crate::net::tokio::TokioFetch;

use crate::error::FetchError;
use crate::task::{Fetcher, Scheduler, Task};
use crate::utils::strip_fragment;

pub const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=UTF-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub url: String,
    pub method: Method,
    /// Ask for the body as raw bytes instead of text.
    pub binary: bool,
    pub data: Option<String>,
    pub content_type: String,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            binary: false,
            data: None,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
        }
    }

    pub fn post(url: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            data: Some(data.into()),
            ..Self::get(url)
        }
    }

    pub fn binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Body {
    #[default]
    Empty,
    Text(String),
    Binary(Vec<u8>),
}

impl Body {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Empty => &[],
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    /// `0` stands for local access without a transport status.
    pub status: u16,
    pub url: String,
    pub body: Body,
}

impl Response {
    pub fn new(url: impl Into<String>, status: u16, body: Body) -> Self {
        Self {
            status,
            url: url.into(),
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, 0 | 200)
    }
}

/// Transport primitive. Implementations complete the returned task on the
/// given scheduler; transport failures are reported through the status code,
/// not as task errors.
pub trait RawFetch {
    fn fetch(&self, scheduler: &Scheduler, request: Request) -> Task<Response>;
}

impl<F> RawFetch for F
where
    F: Fn(&Scheduler, Request) -> Task<Response>,
{
    fn fetch(&self, scheduler: &Scheduler, request: Request) -> Task<Response> {
        self(scheduler, request)
    }
}

type Parser<R> = Rc<dyn Fn(Response, &ResourceStore<R>) -> Task<R>>;

struct StoreInner<R: Clone + 'static> {
    scheduler: Scheduler,
    fetch: Rc<dyn RawFetch>,
    parser: Parser<R>,
    binary: bool,
    resources: RefCell<HashMap<String, R>>,
    fetchers: RefCell<HashMap<String, Fetcher<R>>>,
}

/// Deduplicating cache of parsed resources keyed by URL without fragment.
///
/// A URL is either resolved, in flight, or unknown. Failed loads leave it
/// unknown so the next [`load`](ResourceStore::load) tries again.
pub struct ResourceStore<R: Clone + 'static> {
    inner: Rc<StoreInner<R>>,
}

impl<R: Clone + 'static> Clone for ResourceStore<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: Clone + 'static> ResourceStore<R> {
    pub fn new(
        scheduler: &Scheduler,
        fetch: Rc<dyn RawFetch>,
        parser: impl Fn(Response, &ResourceStore<R>) -> Task<R> + 'static,
        binary: bool,
    ) -> Self {
        Self {
            inner: Rc::new(StoreInner {
                scheduler: scheduler.clone(),
                fetch,
                parser: Rc::new(parser),
                binary,
                resources: RefCell::new(HashMap::new()),
                fetchers: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// The resource at `url`, fetching and parsing it if needed.
    pub fn load(&self, url: &str) -> Task<R> {
        let key = strip_fragment(url);
        if let Some(resource) = self.get(key) {
            return Task::ready(&self.inner.scheduler, resource);
        }

        self.fetcher_for(key).get()
    }

    /// The in-flight fetcher for `url`, starting one if necessary. `None` when
    /// the resource is already resolved.
    pub fn fetch(&self, url: &str) -> Option<Fetcher<R>> {
        let key = strip_fragment(url);
        if self.inner.resources.borrow().contains_key(key) {
            return None;
        }

        Some(self.fetcher_for(key))
    }

    pub fn get(&self, url: &str) -> Option<R> {
        self.inner.resources.borrow().get(strip_fragment(url)).cloned()
    }

    fn fetcher_for(&self, key: &str) -> Fetcher<R> {
        let existing = self.inner.fetchers.borrow().get(key).cloned();
        if let Some(fetcher) = existing {
            return fetcher;
        }

        let store = self.clone();
        let url = key.to_string();
        let fetcher = Fetcher::new(&self.inner.scheduler, format!("fetch {key}"), move || {
            store.fetch_inner(url)
        });

        // Registered before starting: a synchronous transport may settle
        // within `start`.
        self.inner
            .fetchers
            .borrow_mut()
            .insert(key.to_string(), fetcher.clone());
        fetcher.start();

        fetcher
    }

    fn fetch_inner(&self, url: String) -> Task<R> {
        let scheduler = &self.inner.scheduler;
        let (frame, task) = scheduler.frame(format!("parse {url}"));
        let request = Request::get(url.clone()).binary(self.inner.binary);

        let store = self.clone();
        let parsed = self.inner.fetch.fetch(scheduler, request).then({
            let store = self.clone();
            let url = url.clone();
            move |response| {
                if !response.is_success() {
                    let err = FetchError::Status {
                        url,
                        status: response.status,
                    };
                    return Task::failed(&store.inner.scheduler, err);
                }
                (store.inner.parser)(response, &store)
            }
        });

        parsed.observe(move |outcome| {
            store.inner.fetchers.borrow_mut().remove(&url);
            match &outcome {
                Ok(resource) => {
                    tracing::debug!(%url, "resource resolved");
                    store
                        .inner
                        .resources
                        .borrow_mut()
                        .insert(url, resource.clone());
                }
                Err(err) => tracing::warn!(%url, error = %err, "failed to load resource"),
            }
            frame.complete(outcome);
        });

        task
    }
}
