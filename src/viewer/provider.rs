use serde_json::Value;

use crate::task::{Fetcher, Scheduler, Task};
use crate::viewer::command::{DocumentKind, UserStyleSheet};
use crate::viewer::config::{Preferences, ViewportSize};

/// Location inside the document's reading order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub spine_index: usize,
    pub offset_in_item: usize,
}

/// A laid out page.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub is_first_page: bool,
    pub is_last_page: bool,
    /// Resources (images, fonts) still loading for this page.
    pub fetchers: Vec<Fetcher<()>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Navigation {
    NextPage,
    PreviousPage,
    NextSpread,
    PreviousSpread,
    FirstPage,
    LastPage,
    EPage(f64),
    Url(String),
}

#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub kind: DocumentKind,
    pub url: String,
    pub fragment: Option<String>,
    pub user_style_sheets: Vec<UserStyleSheet>,
    /// The package carries zip metadata describing its entries.
    pub zip_metadata: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LoadedDocument {
    pub metadata: Option<Value>,
    /// Where reading starts, resolved from the requested fragment.
    pub position: Option<Position>,
}

/// Everything a layout depends on besides the host size.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub font_size: f64,
    pub viewport: Option<ViewportSize>,
    pub preferences: Preferences,
    pub spread_view: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostSize {
    pub width: u32,
    pub height: u32,
}

/// Layout, pagination and rendering. The viewer only sequences these calls.
pub trait PageProvider {
    fn load_document(&self, scheduler: &Scheduler, request: &LoadRequest) -> Task<LoadedDocument>;

    /// Lays the document out again and returns the page at `position`, or at
    /// the start when there is none.
    fn resize(&self, scheduler: &Scheduler, layout: &Layout, position: Option<Position>) -> Task<Page>;

    fn render_all_pages(&self, scheduler: &Scheduler) -> Task<()>;

    /// `None` when there is nowhere to go, e.g. next from the last page.
    fn navigate(&self, scheduler: &Scheduler, navigation: &Navigation) -> Task<Option<Page>>;

    fn page_position(&self) -> Option<Position>;

    fn cfi(&self, scheduler: &Scheduler, position: Position) -> Task<Option<String>>;

    fn epage_from_position(&self, scheduler: &Scheduler, position: Position) -> Task<f64>;

    fn epage_count(&self) -> f64;

    fn is_toc_visible(&self) -> bool;

    fn show_toc(&self, scheduler: &Scheduler, autohide: bool) -> Task<Option<Page>>;

    fn hide_toc(&self);

    /// Current size of the host area, compared between layouts to skip
    /// needless work.
    fn host_size(&self) -> Option<HostSize> {
        None
    }
}
