use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::viewer::provider::Layout;

/// Rendering preferences handed to the page provider with every layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Preferences {
    pub font_family: String,
    pub line_height: f64,
    pub column_width: f64,
    pub hyphenate: bool,
    pub horizontal: bool,
    pub night_mode: bool,
    /// Lay out the whole document after the first page is shown.
    pub render_all_pages: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            font_family: String::from("serif"),
            line_height: 1.25,
            column_width: 45.0,
            hyphenate: false,
            horizontal: false,
            night_mode: false,
            render_all_pages: true,
        }
    }
}

/// Explicit viewport geometry in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewportSize {
    pub margin_left: f64,
    pub margin_right: f64,
    pub margin_top: f64,
    pub margin_bottom: f64,
    pub width: f64,
    pub height: f64,
}

/// Viewer state changed by the `configure` command.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub font_size: f64,
    /// Follow host size changes. Cleared by an explicit viewport.
    pub autoresize: bool,
    pub viewport: Option<ViewportSize>,
    pub preferences: Preferences,
    /// Wait for page resources before reporting the position.
    pub wait_for_loading: bool,
    pub spread_view: bool,
    pub resource_base_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            font_size: 16.0,
            autoresize: false,
            viewport: None,
            preferences: Preferences::default(),
            wait_for_loading: false,
            spread_view: false,
            resource_base_url: None,
        }
    }
}

impl Settings {
    /// Applies a `configure` command. Returns whether the document has to be
    /// laid out again.
    pub fn apply(&mut self, cmd: &Configure) -> bool {
        let mut need_resize = false;

        if let Some(autoresize) = cmd.autoresize {
            self.autoresize = autoresize;
            if autoresize {
                self.viewport = None;
                need_resize = true;
            }
        }

        if let Some(font_size) = cmd.font_size {
            if (5.0..=72.0).contains(&font_size) && self.font_size != font_size {
                self.font_size = font_size;
                need_resize = true;
            }
        }

        if let Some(viewport) = &cmd.viewport {
            let size = viewport.resolve(self.font_size);
            if size.width >= 200.0 || size.height >= 200.0 {
                self.autoresize = false;
                self.viewport = Some(size);
                need_resize = true;
            }
        }

        let prefs = &mut self.preferences;
        if let Some(hyphenate) = cmd.hyphenate {
            prefs.hyphenate = hyphenate;
            need_resize = true;
        }
        if let Some(horizontal) = cmd.horizontal {
            prefs.horizontal = horizontal;
            need_resize = true;
        }
        if let Some(night_mode) = cmd.night_mode {
            prefs.night_mode = night_mode;
            need_resize = true;
        }
        if let Some(line_height) = cmd.line_height {
            prefs.line_height = line_height;
            need_resize = true;
        }
        if let Some(column_width) = cmd.column_width {
            prefs.column_width = column_width;
            need_resize = true;
        }
        if let Some(font_family) = &cmd.font_family {
            prefs.font_family = font_family.clone();
            need_resize = true;
        }
        if let Some(render_all_pages) = cmd.render_all_pages {
            prefs.render_all_pages = render_all_pages;
        }

        if let Some(load) = cmd.load {
            self.wait_for_loading = load;
        }
        if let Some(url) = &cmd.user_agent_root_url {
            self.resource_base_url = Some(url.clone());
        }
        if let Some(spread_view) = cmd.spread_view {
            self.spread_view = spread_view;
        }

        need_resize
    }

    pub fn layout(&self) -> Layout {
        Layout {
            font_size: self.font_size,
            viewport: self.viewport,
            preferences: self.preferences.clone(),
            spread_view: self.spread_view,
        }
    }
}

/// Parameters of the `configure` command. Every field is optional; absent or
/// wrongly typed fields leave the setting untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configure {
    #[serde(default, deserialize_with = "typed")]
    pub autoresize: Option<bool>,
    #[serde(default, deserialize_with = "typed")]
    pub font_size: Option<f64>,
    #[serde(default, deserialize_with = "typed")]
    pub viewport: Option<ViewportSpec>,
    #[serde(default, deserialize_with = "typed")]
    pub hyphenate: Option<bool>,
    #[serde(default, deserialize_with = "typed")]
    pub horizontal: Option<bool>,
    #[serde(default, deserialize_with = "typed")]
    pub night_mode: Option<bool>,
    #[serde(default, deserialize_with = "typed")]
    pub line_height: Option<f64>,
    #[serde(default, deserialize_with = "typed")]
    pub column_width: Option<f64>,
    #[serde(default, deserialize_with = "typed")]
    pub font_family: Option<String>,
    #[serde(default, deserialize_with = "typed")]
    pub load: Option<bool>,
    #[serde(default, deserialize_with = "typed")]
    pub render_all_pages: Option<bool>,
    #[serde(rename = "userAgentRootURL", default, deserialize_with = "typed")]
    pub user_agent_root_url: Option<String>,
    #[serde(default, deserialize_with = "typed")]
    pub spread_view: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ViewportSpec {
    #[serde(rename = "margin-left", default, deserialize_with = "typed")]
    pub margin_left: Option<Length>,
    #[serde(rename = "margin-right", default, deserialize_with = "typed")]
    pub margin_right: Option<Length>,
    #[serde(rename = "margin-top", default, deserialize_with = "typed")]
    pub margin_top: Option<Length>,
    #[serde(rename = "margin-bottom", default, deserialize_with = "typed")]
    pub margin_bottom: Option<Length>,
    #[serde(default, deserialize_with = "typed")]
    pub width: Option<Length>,
    #[serde(default, deserialize_with = "typed")]
    pub height: Option<Length>,
}

impl ViewportSpec {
    /// Resolves every length against `font_size`. Missing or unparsable
    /// lengths become zero.
    pub fn resolve(&self, font_size: f64) -> ViewportSize {
        let px = |length: &Option<Length>| match length {
            Some(length) => zero_if_nan(resolve_length(length, font_size)),
            None => 0.0,
        };

        ViewportSize {
            margin_left: px(&self.margin_left),
            margin_right: px(&self.margin_right),
            margin_top: px(&self.margin_top),
            margin_bottom: px(&self.margin_bottom),
            width: px(&self.width),
            height: px(&self.height),
        }
    }
}

/// A CSS length as sent by the embedder: a bare number of pixels or a string
/// such as `"12em"`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Length {
    Number(f64),
    Text(String),
}

/// Reads a command field only when it holds the expected JSON type. Anything
/// else counts as absent.
pub(crate) fn typed<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Reads a flag the loose way: `null`, `false`, `0`, `NaN` and `""` are off,
/// everything else is on.
pub(crate) fn truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let flag = match Value::deserialize(deserializer)? {
        Value::Null => false,
        Value::Bool(flag) => flag,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    };
    Ok(flag)
}

const EM: f64 = 16.0;
const EX: f64 = 8.0;

/// Size of one unit in CSS pixels, for absolute units.
fn unit_size(unit: &str) -> Option<f64> {
    let size = match unit {
        "px" => 1.0,
        "in" => 96.0,
        "pt" => 4.0 / 3.0,
        "pc" => 16.0,
        "cm" => 96.0 / 2.54,
        "mm" => 96.0 / 25.4,
        "q" => 96.0 / 2.54 / 40.0,
        _ => return None,
    };
    Some(size)
}

/// Converts a length to CSS pixels. Font-relative units scale with
/// `font_size`; unknown units leave the number as is. A string without a
/// leading number resolves to NaN.
pub fn resolve_length(length: &Length, font_size: f64) -> f64 {
    let text = match length {
        Length::Number(value) => return *value,
        Length::Text(text) => text.as_str(),
    };

    let value = parse_float_prefix(text);
    let unit_start = text
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_lowercase())
        .last()
        .map(|(index, _)| index);

    let Some(unit_start) = unit_start else {
        return value;
    };

    match &text[unit_start..] {
        "em" | "rem" => value * font_size,
        "ex" | "rex" => value * EX * font_size / EM,
        unit => unit_size(unit).map_or(value, |size| value * size),
    }
}

/// Parses the longest prefix of `text` that forms a decimal number.
fn parse_float_prefix(text: &str) -> f64 {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let digits = |from: usize| {
        bytes[from..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count()
    };

    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end += 1;
    }

    let int_digits = digits(end);
    end += int_digits;

    let mut frac_digits = 0;
    if bytes.get(end) == Some(&b'.') {
        frac_digits = digits(end + 1);
        if int_digits > 0 || frac_digits > 0 {
            end += 1 + frac_digits;
        }
    }

    if int_digits == 0 && frac_digits == 0 {
        return f64::NAN;
    }

    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        let exp_digits = digits(exp);
        if exp_digits > 0 {
            end = exp + exp_digits;
        }
    }

    text[..end].parse().unwrap_or(f64::NAN)
}

fn zero_if_nan(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value }
}
