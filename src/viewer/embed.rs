use std::rc::Rc;

use serde_json::Value;

use crate::net::{RawFetch, Request};
use crate::task::{Fetcher, Scheduler};
use crate::viewer::Viewer;
use crate::viewer::provider::PageProvider;

/// Notification sink that POSTs every message as JSON to `url`. Each post
/// runs as its own fetcher; failures are logged and otherwise ignored.
pub fn post_message_sink(
    scheduler: &Scheduler,
    fetch: Rc<dyn RawFetch>,
    url: impl Into<String>,
) -> impl Fn(Value) + 'static {
    let scheduler = scheduler.clone();
    let url = url.into();

    move |message: Value| {
        let body = message.to_string();
        let fetch = fetch.clone();
        let url = url.clone();
        let sched = scheduler.clone();

        let fetcher = Fetcher::new(&scheduler, "postMessage", move || {
            fetch.fetch(&sched, Request::post(url, body)).map(|response| {
                if !response.is_success() {
                    tracing::warn!(url = %response.url, status = response.status, "message post failed");
                }
            })
        });
        fetcher.start();
    }
}

/// Creates a viewer reporting to `msg_url` and starts its command loop with
/// `command`.
pub fn init_embedded(
    scheduler: &Scheduler,
    provider: Rc<dyn PageProvider>,
    fetch: Rc<dyn RawFetch>,
    msg_url: impl Into<String>,
    instance_id: impl Into<String>,
    command: Option<Value>,
) -> Viewer {
    let sink = post_message_sink(scheduler, fetch, msg_url);
    let viewer = Viewer::new(scheduler, provider, instance_id, sink);
    viewer.init_embed(command);
    viewer
}
