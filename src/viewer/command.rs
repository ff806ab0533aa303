use serde::Deserialize;
use serde_json::Value;

use crate::error::CommandError;
use crate::viewer::config::{Configure, truthy, typed};
use crate::viewer::provider::Navigation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    /// A packaged publication.
    Package,
    /// A single XML or HTML document.
    Single,
}

/// The closed set of commands the viewer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    LoadDocument(DocumentKind),
    Configure,
    MoveTo,
    ShowToc,
}

impl Action {
    pub fn from_name(name: &str) -> Option<Self> {
        let action = match name {
            "loadDocument" | "loadEPUB" => Self::LoadDocument(DocumentKind::Package),
            "loadXML" => Self::LoadDocument(DocumentKind::Single),
            "configure" => Self::Configure,
            "moveTo" => Self::MoveTo,
            "showTOC" | "toc" => Self::ShowToc,
            _ => return None,
        };
        Some(action)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::LoadDocument(DocumentKind::Package) => "loadDocument",
            Self::LoadDocument(DocumentKind::Single) => "loadXML",
            Self::Configure => "configure",
            Self::MoveTo => "moveTo",
            Self::ShowToc => "showTOC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserStyleSheet {
    #[serde(default, deserialize_with = "typed")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "typed")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadDocument {
    pub url: String,
    #[serde(default, deserialize_with = "typed")]
    pub fragment: Option<String>,
    #[serde(default, deserialize_with = "typed")]
    pub user_style_sheet: Option<Vec<UserStyleSheet>>,
    #[serde(default, deserialize_with = "truthy")]
    pub zipmeta: bool,
    #[serde(flatten)]
    pub configure: Configure,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MoveTo {
    #[serde(rename = "where", default, deserialize_with = "typed")]
    pub target: Option<String>,
    #[serde(default, deserialize_with = "typed")]
    pub epage: Option<f64>,
    #[serde(default, deserialize_with = "typed")]
    pub url: Option<String>,
}

impl MoveTo {
    /// `where` takes precedence over `epage`, which takes precedence over
    /// `url`. An unknown `where` means no navigation at all.
    pub fn navigation(&self, spread_view: bool) -> Option<Navigation> {
        if let Some(target) = &self.target {
            return match target.as_str() {
                "next" if spread_view => Some(Navigation::NextSpread),
                "next" => Some(Navigation::NextPage),
                "previous" if spread_view => Some(Navigation::PreviousSpread),
                "previous" => Some(Navigation::PreviousPage),
                "first" => Some(Navigation::FirstPage),
                "last" => Some(Navigation::LastPage),
                _ => None,
            };
        }

        if let Some(epage) = self.epage {
            return Some(Navigation::EPage(epage));
        }

        self.url.clone().map(Navigation::Url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Show,
    Hide,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShowToc {
    #[serde(default, deserialize_with = "typed")]
    pub v: Option<String>,
    #[serde(default, deserialize_with = "truthy")]
    pub autohide: bool,
}

impl ShowToc {
    /// Requested visibility. Anything else toggles.
    pub fn visibility(&self) -> Option<Visibility> {
        match self.v.as_deref() {
            Some("show") => Some(Visibility::Show),
            Some("hide") => Some(Visibility::Hide),
            _ => None,
        }
    }
}

/// Anything the embedder may submit as a command.
pub trait IntoCommand {
    fn into_command(self) -> Result<Value, CommandError>;
}

impl IntoCommand for Value {
    fn into_command(self) -> Result<Value, CommandError> {
        Ok(self)
    }
}

impl IntoCommand for &str {
    fn into_command(self) -> Result<Value, CommandError> {
        Ok(serde_json::from_str(self)?)
    }
}

impl IntoCommand for String {
    fn into_command(self) -> Result<Value, CommandError> {
        self.as_str().into_command()
    }
}
