//! The embeddable viewer's command loop.
//!
//! The embedder talks to a [`Viewer`] through [`Viewer::submit_command`] and
//! hears back through a notification sink. Commands are processed one at a
//! time by a loop running on the [`Scheduler`]; a pending re-layout always
//! goes first, and an idle loop parks itself until it is kicked by a new
//! command or a resize request.
mod command;
mod config;
mod embed;
mod notification;
mod provider;

use std::cell::RefCell;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde_json::Value;

pub use crate::viewer::command::{
    Action, DocumentKind, IntoCommand, LoadDocument, MoveTo, ShowToc, UserStyleSheet, Visibility,
};
pub use crate::viewer::config::{
    Configure, Length, Preferences, Settings, ViewportSize, ViewportSpec, resolve_length,
};
pub use crate::viewer::embed::{init_embedded, post_message_sink};
pub use crate::viewer::notification::Notification;
pub use crate::viewer::provider::{
    HostSize, Layout, LoadRequest, LoadedDocument, Navigation, Page, PageProvider, Position,
};

use crate::error::CommandError;
use crate::task::{Continuation, LoopFrame, Scheduler, Task, wait_for_fetchers};

/// What the command loop is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    NotStarted,
    /// Laying out the document again.
    ResizePending,
    /// Running a command.
    CommandPending,
    /// Parked until a command or resize request arrives.
    WaitingForCommand,
    Stopped,
}

struct ViewerState {
    settings: Settings,
    need_resize: bool,
    /// Re-layout even if nothing seems to have changed.
    force_layout: bool,
    /// The single command slot.
    pending: Option<Value>,
    parked: Option<Continuation<()>>,
    loop_state: LoopState,
    shutdown: bool,
    package_url: Option<String>,
    document_loaded: bool,
    current_page: Option<Page>,
    page_position: Option<Position>,
    last_layout: Option<(Layout, Option<HostSize>)>,
}

struct ViewerInner {
    scheduler: Scheduler,
    provider: Rc<dyn PageProvider>,
    instance_id: String,
    sink: Box<dyn Fn(Value)>,
    state: RefCell<ViewerState>,
}

enum Step {
    Resize,
    Command(Value),
    Wait,
    Stop,
}

#[derive(Clone)]
pub struct Viewer {
    inner: Rc<ViewerInner>,
}

impl Viewer {
    pub fn new(
        scheduler: &Scheduler,
        provider: Rc<dyn PageProvider>,
        instance_id: impl Into<String>,
        sink: impl Fn(Value) + 'static,
    ) -> Self {
        Self {
            inner: Rc::new(ViewerInner {
                scheduler: scheduler.clone(),
                provider,
                instance_id: instance_id.into(),
                sink: Box::new(sink),
                state: RefCell::new(ViewerState {
                    settings: Settings::default(),
                    need_resize: false,
                    force_layout: false,
                    pending: None,
                    parked: None,
                    loop_state: LoopState::NotStarted,
                    shutdown: false,
                    package_url: None,
                    document_loaded: false,
                    current_page: None,
                    page_position: None,
                    last_layout: None,
                }),
            }),
        }
    }

    /// Starts the command loop, optionally with a first command.
    pub fn init_embed(&self, command: Option<Value>) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.loop_state != LoopState::NotStarted {
                tracing::warn!(instance = %self.inner.instance_id, "command loop already started");
                return;
            }
            if command.is_some() {
                state.pending = command;
            }
            state.loop_state = LoopState::WaitingForCommand;
        }

        tracing::debug!(instance = %self.inner.instance_id, "starting command loop");

        let scheduler = self.inner.scheduler.clone();
        let viewer = Rc::downgrade(&self.inner);
        self.inner.scheduler.run(move || {
            let on_exit = viewer.clone();
            scheduler
                .loop_with_frame("commandLoop", move |frame| match viewer.upgrade() {
                    Some(inner) => Viewer { inner }.iterate(frame),
                    None => frame.break_loop(),
                })
                .map(move |()| {
                    if let Some(inner) = on_exit.upgrade() {
                        inner.state.borrow_mut().loop_state = LoopState::Stopped;
                    }
                })
        });
    }

    /// Queues a command for the loop. Returns `false` if the command slot is
    /// occupied or the command is not valid JSON.
    pub fn submit_command(&self, command: impl IntoCommand) -> bool {
        let command = match command.into_command() {
            Ok(command) => command,
            Err(err) => {
                tracing::warn!(error = %err, "rejected malformed command");
                return false;
            }
        };

        {
            let mut state = self.inner.state.borrow_mut();
            if state.pending.is_some() {
                tracing::warn!("command slot occupied, rejecting command");
                return false;
            }
            state.pending = Some(command);
        }

        self.kick();
        true
    }

    /// Forces a re-layout before the next command.
    pub fn request_resize(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            state.need_resize = true;
            state.force_layout = true;
        }
        self.kick();
    }

    /// The host area changed size. Ignored unless `autoresize` is on.
    pub fn host_resized(&self) {
        if !self.inner.state.borrow().settings.autoresize {
            return;
        }

        self.inner.state.borrow_mut().need_resize = true;
        self.kick();
    }

    /// Tells the embedder that a link to `href` was followed.
    pub fn hyperlink(&self, href: impl Into<String>) {
        let href = href.into();
        let internal = self
            .inner
            .state
            .borrow()
            .package_url
            .as_deref()
            .is_some_and(|base| href.starts_with(base));

        let viewer = self.clone();
        let scheduler = self.inner.scheduler.clone();
        self.inner.scheduler.run(move || {
            viewer.notify(Notification::Hyperlink { href, internal });
            Task::ready(&scheduler, true)
        });
    }

    /// Ends the command loop once the current iteration finishes.
    pub fn shutdown(&self) {
        self.inner.state.borrow_mut().shutdown = true;
        self.kick();
    }

    pub fn loop_state(&self) -> LoopState {
        self.inner.state.borrow().loop_state
    }

    pub fn settings(&self) -> Settings {
        self.inner.state.borrow().settings.clone()
    }

    pub fn current_page(&self) -> Option<Page> {
        self.inner.state.borrow().current_page.clone()
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    fn kick(&self) {
        let parked = self.inner.state.borrow_mut().parked.take();
        if let Some(continuation) = parked {
            continuation.schedule(());
        }
    }

    fn iterate(&self, frame: LoopFrame) {
        let step = {
            let mut state = self.inner.state.borrow_mut();
            let (step, loop_state) = if state.shutdown {
                (Step::Stop, LoopState::Stopped)
            } else if state.need_resize {
                (Step::Resize, LoopState::ResizePending)
            } else if let Some(command) = state.pending.take() {
                (Step::Command(command), LoopState::CommandPending)
            } else {
                (Step::Wait, LoopState::WaitingForCommand)
            };
            state.loop_state = loop_state;
            step
        };

        match step {
            Step::Resize => {
                let viewer = self.clone();
                let scheduler = self.inner.scheduler.clone();
                self.inner
                    .scheduler
                    .handle(
                        "resize",
                        move |resized| {
                            viewer.resize().then_finish(resized);
                            Ok(())
                        },
                        move |resized, err| {
                            scheduler.report(&err);
                            resized.finish(false);
                        },
                    )
                    .observe(move |_| frame.continue_loop());
            }
            Step::Command(command) => {
                self.run_command(command)
                    .observe(move |_| frame.continue_loop());
            }
            Step::Wait => {
                let (wait, waiting) = self.inner.scheduler.frame::<()>("waitForCommand");
                self.inner.state.borrow_mut().parked = Some(wait.suspend("command"));
                waiting.observe(move |_| frame.continue_loop());
            }
            Step::Stop => {
                tracing::debug!(instance = %self.inner.instance_id, "command loop stopped");
                frame.break_loop();
            }
        }
    }

    fn run_command(&self, command: Value) -> Task<bool> {
        let name = command
            .get("a")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        tracing::debug!(action = %name, "running command");

        let viewer = self.clone();
        let reporter = self.clone();
        let action_name = name.clone();

        self.inner.scheduler.handle(
            "runCommand",
            move |frame| {
                let action = Action::from_name(&name)
                    .ok_or_else(|| CommandError::UnknownAction(name.clone()))?;

                let notifier = viewer.clone();
                viewer
                    .dispatch(action, command)?
                    .map(move |_| {
                        notifier.notify(Notification::Done { a: name });
                        true
                    })
                    .then_finish(frame);

                Ok(())
            },
            move |frame, err| {
                tracing::warn!(action = %action_name, error = %err, "command failed");
                reporter.notify(Notification::Error {
                    a: action_name,
                    content: err.to_string(),
                });
                frame.finish(true);
            },
        )
    }

    fn dispatch(&self, action: Action, command: Value) -> Result<Task<bool>, CommandError> {
        let task = match action {
            Action::LoadDocument(kind) => self.load_document(kind, params(action, command)?),
            Action::Configure => self.configure(&params(action, command)?),
            Action::MoveTo => self.move_to(params(action, command)?),
            Action::ShowToc => self.show_toc(params(action, command)?),
        };
        Ok(task)
    }

    fn configure(&self, cmd: &Configure) -> Task<bool> {
        self.apply_settings(cmd);
        Task::ready(&self.inner.scheduler, true)
    }

    fn apply_settings(&self, cmd: &Configure) {
        let mut state = self.inner.state.borrow_mut();
        if state.settings.apply(cmd) {
            state.need_resize = true;
        }
    }

    fn load_document(&self, kind: DocumentKind, cmd: LoadDocument) -> Task<bool> {
        self.apply_settings(&cmd.configure);

        let request = LoadRequest {
            kind,
            url: cmd.url.clone(),
            fragment: cmd.fragment,
            user_style_sheets: cmd.user_style_sheet.unwrap_or_default(),
            zip_metadata: cmd.zipmeta,
        };

        {
            let mut state = self.inner.state.borrow_mut();
            state.package_url = Some(cmd.url);
            state.document_loaded = false;
            state.current_page = None;
            state.page_position = None;
            state.last_layout = None;
        }

        tracing::info!(url = %request.url, ?kind, "loading document");

        let viewer = self.clone();
        self.inner
            .provider
            .load_document(&self.inner.scheduler, &request)
            .then(move |document| {
                {
                    let mut state = viewer.inner.state.borrow_mut();
                    state.document_loaded = true;
                    state.page_position = document.position;
                }

                let notifier = viewer.clone();
                let metadata = document.metadata;
                viewer.resize().map(move |_| {
                    notifier.notify(Notification::Loaded { metadata });
                    true
                })
            })
    }

    /// Lays the document out for the current settings. Skipped while no
    /// document is loaded and when neither the layout nor the host size
    /// changed since the last one.
    fn resize(&self) -> Task<bool> {
        let scheduler = &self.inner.scheduler;
        let provider = &self.inner.provider;
        let host = provider.host_size();

        let (layout, fill_position) = {
            let mut state = self.inner.state.borrow_mut();
            state.need_resize = false;
            let forced = std::mem::take(&mut state.force_layout);

            if !state.document_loaded {
                tracing::debug!("no document loaded, skipping layout");
                return Task::ready(scheduler, true);
            }

            let layout = state.settings.layout();
            let unchanged = layout.viewport.is_none()
                && state
                    .last_layout
                    .as_ref()
                    .is_some_and(|(last, last_host)| *last == layout && *last_host == host);
            if unchanged && !forced {
                tracing::debug!("layout unchanged, skipping");
                return Task::ready(scheduler, true);
            }

            let fill_position = state.current_page.is_some() && state.page_position.is_none();
            (layout, fill_position)
        };

        if fill_position {
            let position = provider.page_position();
            self.inner.state.borrow_mut().page_position = position;
        }
        let position = self.inner.state.borrow().page_position;

        tracing::debug!(font_size = layout.font_size, ?position, "laying out document");

        let viewer = self.clone();
        provider
            .resize(scheduler, &layout, position)
            .then(move |page| {
                let render_all_pages = layout.preferences.render_all_pages;
                viewer.inner.state.borrow_mut().last_layout = Some((layout, host));
                viewer.show_current(page);

                let renderer = viewer.clone();
                viewer.report_position().then(move |reported| {
                    let scheduler = &renderer.inner.scheduler;
                    if render_all_pages {
                        renderer
                            .inner
                            .provider
                            .render_all_pages(scheduler)
                            .map(move |()| reported)
                    } else {
                        Task::ready(scheduler, reported)
                    }
                })
            })
    }

    fn show_current(&self, page: Page) {
        tracing::trace!(first = page.is_first_page, last = page.is_last_page, "showing page");
        self.inner.state.borrow_mut().current_page = Some(page);
    }

    /// Sends a `nav` notification for the current page, once its resources
    /// are loaded if the settings ask for that.
    fn report_position(&self) -> Task<bool> {
        let scheduler = &self.inner.scheduler;
        let stored = self.inner.state.borrow().page_position;
        let Some(position) = stored.or_else(|| self.inner.provider.page_position()) else {
            tracing::debug!("no page position to report");
            return Task::ready(scheduler, true);
        };

        let (page, wait_for_loading) = {
            let mut state = self.inner.state.borrow_mut();
            state.page_position = Some(position);
            (state.current_page.clone(), state.settings.wait_for_loading)
        };
        let Some(page) = page else {
            return Task::ready(scheduler, true);
        };

        let viewer = self.clone();
        self.inner
            .provider
            .cfi(scheduler, position)
            .then(move |cfi| {
                let scheduler = viewer.inner.scheduler.clone();
                let loaded = if wait_for_loading && !page.fetchers.is_empty() {
                    wait_for_fetchers(&scheduler, &page.fetchers)
                } else {
                    Task::ready(&scheduler, ())
                };
                loaded.then(move |()| viewer.send_location(&page, position, cfi))
            })
    }

    fn send_location(&self, page: &Page, position: Position, cfi: Option<String>) -> Task<bool> {
        let (first, last) = (page.is_first_page, page.is_last_page);
        let viewer = self.clone();

        self.inner
            .provider
            .epage_from_position(&self.inner.scheduler, position)
            .map(move |epage| {
                let epage_count = viewer.inner.provider.epage_count();
                viewer.notify(Notification::Nav {
                    first,
                    last,
                    epage,
                    epage_count,
                    cfi,
                });
                true
            })
    }

    fn move_to(&self, cmd: MoveTo) -> Task<bool> {
        let scheduler = &self.inner.scheduler;
        let (spread_view, loaded) = {
            let state = self.inner.state.borrow();
            (state.settings.spread_view, state.document_loaded)
        };

        let Some(navigation) = cmd.navigation(spread_view) else {
            return Task::ready(scheduler, true);
        };
        if !loaded {
            return Task::failed(scheduler, CommandError::NoDocument);
        }

        tracing::debug!(?navigation, "navigating");

        let viewer = self.clone();
        self.inner
            .provider
            .navigate(scheduler, &navigation)
            .then(move |page| match page {
                Some(page) => {
                    viewer.inner.state.borrow_mut().page_position = None;
                    viewer.show_current(page);
                    viewer.report_position()
                }
                None => {
                    tracing::debug!("navigation stayed on the current page");
                    Task::ready(&viewer.inner.scheduler, true)
                }
            })
    }

    fn show_toc(&self, cmd: ShowToc) -> Task<bool> {
        let scheduler = &self.inner.scheduler;
        if !self.inner.state.borrow().document_loaded {
            return Task::failed(scheduler, CommandError::NoDocument);
        }

        let provider = &self.inner.provider;
        let visible = provider.is_toc_visible();

        match (visible, cmd.visibility()) {
            (true, Some(Visibility::Show)) | (false, Some(Visibility::Hide)) => {
                Task::ready(scheduler, true)
            }
            (true, _) => {
                provider.hide_toc();
                Task::ready(scheduler, true)
            }
            (false, _) => provider.show_toc(scheduler, cmd.autohide).map(|page| {
                if page.is_none() {
                    tracing::debug!("document has no table of contents");
                }
                true
            }),
        }
    }

    fn notify(&self, notification: Notification) {
        match notification.to_message(&self.inner.instance_id) {
            Ok(message) => (self.inner.sink)(message),
            Err(err) => tracing::error!(error = %err, "failed to serialize notification"),
        }
    }
}

fn params<P: DeserializeOwned>(action: Action, command: Value) -> Result<P, CommandError> {
    serde_json::from_value(command).map_err(|source| CommandError::Params {
        action: action.name(),
        source,
    })
}
