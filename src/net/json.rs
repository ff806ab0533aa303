use std::rc::Rc;

use serde_json::Value;

use crate::error::FetchError;
use crate::net::{RawFetch, ResourceStore, Response};
use crate::task::{Scheduler, Task};

/// Store of parsed JSON documents.
pub type JsonStore = ResourceStore<Rc<Value>>;

impl ResourceStore<Rc<Value>> {
    pub fn json(scheduler: &Scheduler, fetch: Rc<dyn RawFetch>) -> Self {
        Self::new(scheduler, fetch, parse_json, false)
    }
}

/// Parser for [`JsonStore`]. An empty body parses as `null`.
pub fn parse_json(response: Response, store: &JsonStore) -> Task<Rc<Value>> {
    let bytes = response.body.as_bytes();
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Task::ready(store.scheduler(), Rc::new(Value::Null));
    }

    match serde_json::from_slice(bytes) {
        Ok(value) => Task::ready(store.scheduler(), Rc::new(value)),
        Err(source) => {
            let err = FetchError::Json {
                url: response.url,
                source,
            };
            Task::failed(store.scheduler(), err)
        }
    }
}
