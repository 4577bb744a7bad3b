use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::ExtractionError;
use crate::extraction::config::{Attribute, ExtractionConfig, FieldSpec, Transform};

/// One extracted item: field name to value
pub type Record = BTreeMap<String, FieldValue>;

/// Value of a single extracted field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    /// May be `NaN` when the `number` transform saw malformed input
    Number(f64),
    Bool(bool),
    List(Vec<String>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Null, empty text, an empty list, `false`, zero or `NaN`
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(text) => text.is_empty(),
            Self::List(values) => values.is_empty(),
            Self::Number(n) => *n == 0.0 || n.is_nan(),
            Self::Bool(b) => !b,
        }
    }

    /// JSON form; `NaN` has no JSON representation and becomes `null`
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Text(text) => Value::String(text.clone()),
            Self::Number(n) => Number::from_f64(*n).map_or(Value::Null, Value::Number),
            Self::Bool(b) => Value::Bool(*b),
            Self::List(values) => Value::Array(values.iter().cloned().map(Value::String).collect()),
        }
    }
}

pub fn record_to_json(record: &Record) -> Value {
    let map: Map<String, Value> = record
        .iter()
        .map(|(name, value)| (name.clone(), value.to_json()))
        .collect();
    Value::Object(map)
}

enum Target {
    /// `.`: the item container itself
    Container,
    Descendant(Selector),
    /// Selector that failed to compile; the field always yields null
    Invalid { selector: String, reason: String },
}

struct CompiledField {
    name: String,
    target: Target,
    attribute: Attribute,
    transform: Option<Transform>,
    multiple: bool,
    /// Bare selector specs turn empty text into null
    bare: bool,
}

/// Field Extraction Engine with selectors compiled once per task
pub struct Extractor {
    container: Selector,
    fields: Vec<CompiledField>,
}

impl Extractor {
    pub fn new(config: &ExtractionConfig) -> Result<Self, ExtractionError> {
        let container = Selector::parse(&config.item_container_selector).map_err(|e| {
            ExtractionError::Selector {
                selector: config.item_container_selector.clone(),
                reason: e.to_string(),
            }
        })?;

        let fields = config
            .fields
            .iter()
            .map(|(name, spec)| compile_field(name, spec))
            .collect();

        Ok(Self { container, fields })
    }

    /// One record per element matching the container selector
    pub fn extract(&self, html: &str) -> Vec<Record> {
        let document = Html::parse_document(html);
        let records: Vec<Record> = document
            .select(&self.container)
            .map(|item| self.extract_record(item))
            .collect();

        debug!("Found {} items on page", records.len());
        records
    }

    fn extract_record(&self, item: ElementRef<'_>) -> Record {
        self.fields
            .iter()
            .map(|field| {
                let value = extract_field(field, item).unwrap_or_else(|e| {
                    debug!("Error extracting field: {}", e);
                    FieldValue::Null
                });
                (field.name.clone(), value)
            })
            .collect()
    }
}

fn compile_field(name: &str, spec: &FieldSpec) -> CompiledField {
    let (selector, attribute, transform, multiple, bare) = match spec {
        FieldSpec::Selector(selector) => (selector.as_str(), Attribute::Text, None, false, true),
        FieldSpec::Detailed(detail) => (
            detail.selector.as_str(),
            detail.attribute.clone(),
            detail.transform,
            detail.multiple,
            false,
        ),
    };

    let target = if selector == "." && !bare {
        Target::Container
    } else {
        match Selector::parse(selector) {
            Ok(parsed) => Target::Descendant(parsed),
            Err(e) => Target::Invalid {
                selector: selector.to_string(),
                reason: e.to_string(),
            },
        }
    };

    CompiledField {
        name: name.to_string(),
        target,
        attribute,
        transform,
        multiple,
        bare,
    }
}

fn extract_field(field: &CompiledField, item: ElementRef<'_>) -> Result<FieldValue, ExtractionError> {
    let targets: Vec<ElementRef<'_>> = match &field.target {
        Target::Container => vec![item],
        Target::Descendant(selector) if field.multiple => item.select(selector).collect(),
        Target::Descendant(selector) => item.select(selector).take(1).collect(),
        Target::Invalid { selector, reason } => {
            return Err(ExtractionError::Field {
                field: field.name.clone(),
                reason: format!("invalid selector {}: {}", selector, reason),
            })
        }
    };

    if field.multiple {
        let values = targets
            .into_iter()
            .filter_map(|target| read_attribute(target, &field.attribute))
            .collect();
        return Ok(FieldValue::List(values));
    }

    let Some(target) = targets.into_iter().next() else {
        return Ok(FieldValue::Null);
    };

    let value = match read_attribute(target, &field.attribute) {
        Some(value) if field.bare && value.is_empty() => return Ok(FieldValue::Null),
        Some(value) => value,
        None => return Ok(FieldValue::Null),
    };

    Ok(match field.transform {
        Some(transform) => apply_transform(transform, value),
        None => FieldValue::Text(value),
    })
}

fn read_attribute(target: ElementRef<'_>, attribute: &Attribute) -> Option<String> {
    match attribute {
        Attribute::Text => Some(target.text().collect::<String>().trim().to_string()),
        Attribute::Html => Some(target.inner_html().trim().to_string()),
        Attribute::Named(name) => target.value().attr(name).map(str::to_string),
    }
}

/// Apply a transform to a present value.
///
/// `number` keeps only digits, `.` and `-` and parses the longest numeric
/// prefix of the rest; input without one yields `NaN`, which is kept rather
/// than turned into null.
/// `boolean` is true for every non-empty string, including `"false"`.
pub fn apply_transform(transform: Transform, value: String) -> FieldValue {
    match transform {
        Transform::Number => {
            let digits: String = value
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            FieldValue::Number(parse_number_prefix(&digits))
        }
        Transform::Boolean => FieldValue::Bool(!value.is_empty()),
        Transform::Lowercase => FieldValue::Text(value.to_lowercase()),
        Transform::Uppercase => FieldValue::Text(value.to_uppercase()),
    }
}

/// Parse `[-]digits[.digits]` from the start of `input`, ignoring the rest
fn parse_number_prefix(input: &str) -> f64 {
    let bytes = input.as_bytes();
    let digits_from = |start: usize| {
        bytes[start..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count()
    };

    let mut end = usize::from(bytes.first() == Some(&b'-'));
    let whole = digits_from(end);
    end += whole;

    let mut fraction = 0;
    if bytes.get(end) == Some(&b'.') {
        fraction = digits_from(end + 1);
        if whole > 0 || fraction > 0 {
            end += 1 + fraction;
        }
    }

    if whole == 0 && fraction == 0 {
        return f64::NAN;
    }
    input[..end].parse().unwrap_or(f64::NAN)
}

/// Keep the records that pass the validity filter
pub fn filter_valid(records: Vec<Record>, require_fields: Option<&[String]>) -> Vec<Record> {
    records
        .into_iter()
        .filter(|record| is_valid(record, require_fields))
        .collect()
}

/// With `require_fields`, every named field must be present and non-empty
/// (see [`FieldValue::is_empty`]); otherwise at least one field must be non-null.
pub fn is_valid(record: &Record, require_fields: Option<&[String]>) -> bool {
    match require_fields {
        Some(required) => required
            .iter()
            .all(|name| record.get(name).map_or(false, |value| !value.is_empty())),
        None => record.values().any(|value| !value.is_null()),
    }
}
