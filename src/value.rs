//! Attribute values carried by conformed, dimension and staged rows.
//!
//! Staged attributes arrive as raw text and are parsed against the
//! entity schema into typed [`Value`]s. Decimal equality is numeric, so
//! `10.0` and `10.00` compare equal and produce the same row digest.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::ClassificationError;
use crate::model::{EntityKind, SurrogateKey, UNASSIGNED_LABEL, UNKNOWN_MEMBER_KEY};

/// Possible values an attribute can hold.
///
/// # Examples
///
/// ```
/// use starmerge::Value;
///
/// let price = Value::decimal("12.50").unwrap();
/// assert_eq!(price, Value::decimal("12.5").unwrap());
/// assert!(Value::Null.is_null());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Text(String),
    Decimal(BigDecimal),
    Integer(i64),
    Date(NaiveDate),
    Key(SurrogateKey),
    Null,
}

impl Value {
    /// Parses a decimal literal.
    #[must_use]
    pub fn decimal(raw: &str) -> Option<Self> {
        BigDecimal::from_str(raw.trim()).ok().map(Self::Decimal)
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub const fn as_decimal(&self) -> Option<&BigDecimal> {
        match self {
            Self::Decimal(v) => Some(v),
            _ => None,
        }
    }

    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_key(&self) -> Option<SurrogateKey> {
        match self {
            Self::Key(v) => Some(*v),
            _ => None,
        }
    }

    /// Canonical encoding used for digests. Decimals are normalized so
    /// numerically equal values encode identically.
    #[must_use]
    pub fn canonical(&self) -> String {
        match self {
            Self::Text(v) => format!("t:{v}"),
            Self::Decimal(v) => format!("d:{}", v.normalized()),
            Self::Integer(v) => format!("i:{v}"),
            Self::Date(v) => format!("a:{}", v.format("%Y-%m-%d")),
            Self::Key(v) => format!("k:{v}"),
            Self::Null => "n".to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(v) => f.write_str(v),
            Self::Decimal(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Self::Key(v) => write!(f, "#{v}"),
            Self::Null => f.write_str(UNASSIGNED_LABEL),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<BigDecimal> for Value {
    fn from(v: BigDecimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<SurrogateKey> for Value {
    fn from(v: SurrogateKey) -> Self {
        Self::Key(v)
    }
}

/// Declared type of a schema attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    Text,
    Decimal,
    Integer,
    Date,
    /// Natural key of another conformed entity, stored as its surrogate key.
    Reference(EntityKind),
}

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d.%m.%Y", "%Y/%m/%d"];

impl AttributeType {
    /// Human-readable type name for error messages.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Decimal => "decimal",
            Self::Integer => "integer",
            Self::Date => "date (YYYY-MM-DD)",
            Self::Reference(_) => "reference",
        }
    }

    /// Parses a raw staged value. Blank input yields `Value::Null`.
    ///
    /// References are not resolved here; see the reference resolver.
    ///
    /// # Errors
    ///
    /// Returns `ClassificationError::InvalidAttribute` when the raw text is
    /// not a valid literal of this type.
    pub fn parse(self, name: &str, raw: &str) -> Result<Value, ClassificationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Value::Null);
        }

        let invalid = || ClassificationError::InvalidAttribute {
            name: name.to_string(),
            expected: self.label().to_string(),
            raw: raw.to_string(),
        };

        match self {
            Self::Text | Self::Reference(_) => Ok(Value::Text(trimmed.to_string())),
            Self::Decimal => {
                // Sources disagree on the decimal separator.
                let candidate = if trimmed.contains(',') && !trimmed.contains('.') {
                    trimmed.replace(',', ".")
                } else {
                    trimmed.to_string()
                };
                BigDecimal::from_str(&candidate)
                    .map(Value::Decimal)
                    .map_err(|_| invalid())
            }
            Self::Integer => trimmed.parse::<i64>().map(Value::Integer).map_err(|_| invalid()),
            Self::Date => DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
                .map(Value::Date)
                .ok_or_else(invalid),
        }
    }
}

/// Named attribute values of one row, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, Value>);

impl Attributes {
    /// Creates an empty attribute map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Text value, or the unassigned label when missing.
    #[must_use]
    pub fn text_or_unassigned(&self, name: &str) -> String {
        self.get(name)
            .and_then(Value::as_text)
            .map_or_else(|| UNASSIGNED_LABEL.to_string(), str::to_string)
    }

    /// Referenced surrogate key, or the unknown member when missing.
    #[must_use]
    pub fn key(&self, name: &str) -> SurrogateKey {
        self.get(name)
            .and_then(Value::as_key)
            .unwrap_or(UNKNOWN_MEMBER_KEY)
    }

    #[must_use]
    pub fn decimal(&self, name: &str) -> Option<&BigDecimal> {
        self.get(name).and_then(Value::as_decimal)
    }

    #[must_use]
    pub fn integer(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_integer)
    }

    #[must_use]
    pub fn date(&self, name: &str) -> Option<NaiveDate> {
        self.get(name).and_then(Value::as_date)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
