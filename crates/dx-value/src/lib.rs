#![forbid(unsafe_code)]

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Declared type of a table column, as recorded in transform metadata and
/// manifest entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Numeric,
    Categorical,
    Date,
    Text,
    Id,
}

/// A single cell value.
///
/// Cells arrive untyped from CSV/SQL origins, so every operator and builtin
/// coerces explicitly through the helpers below instead of relying on the
/// variant a value happens to carry. A non-numeric string where a number is
/// required behaves as null, never as NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Utf8(String),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric coercion. `Utf8` parses after trimming; parse failures,
    /// booleans, nulls and NaN all coerce to `None`.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(v) => {
                if v.is_nan() {
                    None
                } else {
                    Some(*v)
                }
            }
            Self::Utf8(v) => parse_text_number(v),
            Self::Bool(_) | Self::Null => None,
        }
    }

    /// Text coercion. Numbers render canonically (integral values without a
    /// fractional part), booleans as `true`/`false`, null as `None`.
    #[must_use]
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(v) => Some(v.to_string()),
            Self::Number(v) => Some(format_number(*v)),
            Self::Utf8(v) => Some(v.clone()),
        }
    }

    /// Truthiness for conditionals and logical operators: `true`, non-zero
    /// finite numbers and non-empty text. Null, `false`, `0` and `""` are
    /// all non-true.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(v) => *v,
            Self::Number(v) => v.is_finite() && *v != 0.0,
            Self::Utf8(v) => !v.is_empty(),
        }
    }

    /// Strict equality for `==`, `recode` keys and `null_if` sentinels.
    ///
    /// Null equals only null. Same-variant values compare directly. A
    /// numeric-looking string equals the corresponding number (`"5" == 5`)
    /// so CSV text columns compare against numeric literals; there is no
    /// other cross-variant equality, so `0 == ""` and `0 == false` are both
    /// false.
    #[must_use]
    pub fn strict_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Null, _) | (_, Self::Null) => false,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Utf8(a), Self::Utf8(b)) => a == b,
            (Self::Number(n), Self::Utf8(s)) | (Self::Utf8(s), Self::Number(n)) => {
                parse_text_number(s) == Some(*n)
            }
            _ => false,
        }
    }

    /// Ordering for `>`, `>=`, `<`, `<=` and `between`: numeric when both
    /// sides coerce to numbers, otherwise lexicographic text comparison
    /// (ISO date strings order correctly as text). `None` when either side
    /// is null.
    #[must_use]
    pub fn compare_order(&self, other: &Self) -> Option<Ordering> {
        if self.is_null() || other.is_null() {
            return None;
        }
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return a.partial_cmp(&b);
        }
        let a = self.as_text()?;
        let b = other.as_text()?;
        Some(a.cmp(&b))
    }

    /// Wrap an arithmetic result, mapping non-finite outcomes back to null
    /// so NaN and infinities never land in a column.
    #[must_use]
    pub fn from_finite(value: f64) -> Self {
        if value.is_finite() {
            Self::Number(value)
        } else {
            Self::Null
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

fn parse_text_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| !n.is_nan())
}

/// Canonical number rendering: integral values print without a fractional
/// part (`150`, not `150.0`); everything else uses the shortest round-trip
/// float form.
#[must_use]
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}
