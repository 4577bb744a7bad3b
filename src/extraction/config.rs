use scraper::Selector;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ConfigError;

/// Hard ceiling on pages per label, regardless of configuration
pub const HARD_PAGE_CAP: u32 = 10;

/// Declarative description of how to locate items, map fields and paginate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionConfig {
    /// Selector matching one element per item
    #[serde(default, alias = "itemContainer")]
    pub item_container_selector: String,

    /// Field name to field spec
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,

    #[serde(default)]
    pub pagination_type: PaginationType,

    #[serde(default = "default_page_param")]
    pub page_param: String,

    #[serde(default = "default_label_param")]
    pub label_param: String,

    /// Page size used by the offset strategy
    #[serde(default = "default_items_per_page")]
    pub items_per_page: u32,

    /// Labels iterated independently, in order. `null` means "no label".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<Option<String>>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_fields: Option<Vec<String>>,

    #[serde(default, alias = "waitForSelector", skip_serializing_if = "Option::is_none")]
    pub wait_selector: Option<String>,

    #[serde(default)]
    pub scroll_to_bottom: bool,

    /// Has-next-page indicator
    #[serde(default, alias = "hasNextPage", skip_serializing_if = "Option::is_none")]
    pub next_page_selector: Option<String>,

    #[serde(default, alias = "blockResources", skip_serializing_if = "Vec::is_empty")]
    pub block_resource_types: Vec<ResourceType>,

    #[serde(default, alias = "pageDelay", skip_serializing_if = "Option::is_none")]
    pub page_delay_ms: Option<u64>,

    #[serde(default, alias = "timeout", skip_serializing_if = "Option::is_none")]
    pub navigation_timeout_ms: Option<u64>,

    #[serde(default, alias = "selectorTimeout", skip_serializing_if = "Option::is_none")]
    pub selector_timeout_ms: Option<u64>,
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_label_param() -> String {
    "label".to_string()
}

fn default_items_per_page() -> u32 {
    10
}

/// Pagination strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PaginationType {
    #[default]
    QueryParam,
    Path,
    Replace,
    Offset,
    /// Any unrecognised strategy; the base URL is used unchanged
    #[serde(other)]
    Unknown,
}

/// Borrowed view of the pagination settings of a config
#[derive(Debug, Clone, Copy)]
pub struct Pagination<'a> {
    pub kind: PaginationType,
    pub page_param: &'a str,
    pub label_param: &'a str,
    pub items_per_page: u32,
}

/// How a single field is located and converted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSpec {
    /// Bare selector, trimmed text content
    Selector(String),
    Detailed(DetailedField),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedField {
    /// CSS selector, or `.` for the item container itself
    pub selector: String,

    #[serde(default)]
    pub attribute: Attribute,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,

    /// Collect every match instead of the first one
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub multiple: bool,
}

/// Which part of the target element becomes the value
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Attribute {
    #[default]
    Text,
    Html,
    Named(String),
}

impl Serialize for Attribute {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Text => serializer.serialize_str("text"),
            Self::Html => serializer.serialize_str("html"),
            Self::Named(name) => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for Attribute {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "text" => Self::Text,
            "html" => Self::Html,
            _ => Self::Named(raw),
        })
    }
}

/// Post-processing applied to a non-null value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transform {
    Number,
    Boolean,
    Lowercase,
    Uppercase,
}

/// Request categories a rendering engine may refuse to load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Image,
    Stylesheet,
    Font,
    Media,
    Script,
    Xhr,
    Fetch,
}

impl ResourceType {
    /// URL patterns matching requests of this type
    pub fn url_patterns(self) -> &'static [&'static str] {
        match self {
            Self::Image => &["*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.svg", "*.ico"],
            Self::Stylesheet => &["*.css"],
            Self::Font => &["*.woff", "*.woff2", "*.ttf", "*.otf"],
            Self::Media => &["*.mp4", "*.webm", "*.mp3", "*.ogg", "*.wav"],
            Self::Script => &["*.js"],
            Self::Xhr | Self::Fetch => &[],
        }
    }

    /// Script installed before any page script runs, for types that no URL pattern can match
    pub fn stub_script(self) -> Option<&'static str> {
        match self {
            Self::Xhr => Some(XHR_STUB),
            Self::Fetch => Some(FETCH_STUB),
            _ => None,
        }
    }
}

const XHR_STUB: &str = r#"
    XMLHttpRequest.prototype.send = function () {
        this.dispatchEvent(new ProgressEvent("error"));
    };
"#;

const FETCH_STUB: &str = r#"
    window.fetch = () => Promise.reject(new TypeError("request blocked"));
"#;

impl ExtractionConfig {
    /// Parse and validate a config received as JSON
    pub fn from_value(mut value: serde_json::Value) -> Result<Self, ConfigError> {
        hoist_selectors(&mut value);
        let config: Self = serde_json::from_value(value)
            .map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the config once, before it reaches a worker
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.item_container_selector.trim().is_empty() {
            return Err(ConfigError::Missing("itemContainerSelector"));
        }
        check_selector("itemContainerSelector", &self.item_container_selector)?;

        if self.fields.is_empty() {
            return Err(ConfigError::Missing("fields"));
        }

        for (name, spec) in &self.fields {
            match spec {
                FieldSpec::Selector(selector) => check_selector(name, selector)?,
                FieldSpec::Detailed(detail) if detail.selector == "." => {}
                FieldSpec::Detailed(detail) => check_selector(name, &detail.selector)?,
            }
        }

        if let Some(required) = &self.require_fields {
            if let Some(unknown) = required.iter().find(|f| !self.fields.contains_key(*f)) {
                return Err(ConfigError::UnknownRequiredField(unknown.clone()));
            }
        }

        if let Some(selector) = &self.wait_selector {
            check_selector("waitSelector", selector)?;
        }
        if let Some(selector) = &self.next_page_selector {
            check_selector("nextPageSelector", selector)?;
        }

        if self.items_per_page == 0 {
            return Err(ConfigError::ZeroValue("itemsPerPage"));
        }
        if self.max_pages == Some(0) {
            return Err(ConfigError::ZeroValue("maxPages"));
        }

        Ok(())
    }

    /// Labels to iterate; a config without labels runs one `None` label
    pub fn labels(&self) -> Vec<Option<String>> {
        match &self.labels {
            Some(labels) if !labels.is_empty() => labels.clone(),
            _ => vec![None],
        }
    }

    /// Page bound for each label: `min(HARD_PAGE_CAP, maxPages)`
    pub fn page_limit(&self, task_max_pages: u32) -> u32 {
        self.max_pages
            .unwrap_or(task_max_pages)
            .min(HARD_PAGE_CAP)
    }

    pub fn pagination(&self) -> Pagination<'_> {
        Pagination {
            kind: self.pagination_type,
            page_param: &self.page_param,
            label_param: &self.label_param,
            items_per_page: self.items_per_page,
        }
    }

    pub fn navigation_timeout(&self, default: Duration) -> Duration {
        self.navigation_timeout_ms.map_or(default, Duration::from_millis)
    }

    pub fn selector_timeout(&self, default: Duration) -> Duration {
        self.selector_timeout_ms.map_or(default, Duration::from_millis)
    }

    pub fn page_delay(&self) -> Option<Duration> {
        self.page_delay_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Lift `selectors.itemContainer` and `selectors.fields` to the top level.
/// Keys already present at the top level win.
fn hoist_selectors(value: &mut serde_json::Value) {
    let Some(object) = value.as_object_mut() else {
        return;
    };
    let Some(serde_json::Value::Object(selectors)) = object.remove("selectors") else {
        return;
    };

    let has_container = object.contains_key("itemContainerSelector") || object.contains_key("itemContainer");
    for (key, inner) in selectors {
        match key.as_str() {
            "itemContainer" | "itemContainerSelector" if !has_container => {
                object.insert("itemContainerSelector".to_string(), inner);
            }
            "fields" if !object.contains_key("fields") => {
                object.insert("fields".to_string(), inner);
            }
            _ => {}
        }
    }
}

fn check_selector(field: &str, selector: &str) -> Result<(), ConfigError> {
    Selector::parse(selector)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidSelector {
            field: field.to_string(),
            selector: selector.to_string(),
            reason: e.to_string(),
        })
}
