use serde::{Deserialize, Serialize};
use std::{fmt, slice};
use thiserror::Error as ThisError;

///
/// ValueError
///

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum ValueError {
    #[error("range is inverted: from {from} exceeds to {to}")]
    RangeInverted { from: i64, to: i64 },

    #[error("arrays may not nest")]
    NestedArray,
}

///
/// ValueType
///
/// Declared scalar type of an indexed attribute, supplied by the schema
/// collaborator and trusted by the indexes.
///

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ValueType {
    Bool,
    Int,
    Decimal,
    Text,
    NumberRange,
}

impl ValueType {
    /// Range-typed attributes additionally maintain a range sub-index.
    #[must_use]
    pub const fn is_range(self) -> bool {
        matches!(self, Self::NumberRange)
    }
}

///
/// NumberRange
///
/// Closed interval `[from, to]`, inclusive at both ends.
///

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct NumberRange {
    from: i64,
    to: i64,
}

impl NumberRange {
    pub const fn new(from: i64, to: i64) -> Result<Self, ValueError> {
        if from > to {
            return Err(ValueError::RangeInverted { from, to });
        }

        Ok(Self { from, to })
    }

    #[must_use]
    pub const fn from(self) -> i64 {
        self.from
    }

    #[must_use]
    pub const fn to(self) -> i64 {
        self.to
    }

    #[must_use]
    pub const fn contains_point(self, point: i64) -> bool {
        self.from <= point && point <= self.to
    }

    #[must_use]
    pub const fn overlaps(self, other: Self) -> bool {
        self.from <= other.to && other.from <= self.to
    }

    /// Merge overlapping and adjacent ranges into the minimal set of
    /// disjoint, non-adjacent intervals. Registration against the range
    /// sub-index always goes through this, so one record id never counts
    /// an interval it logically touches only once twice.
    #[must_use]
    pub fn consolidate(mut ranges: Vec<Self>) -> Vec<Self> {
        if ranges.len() < 2 {
            return ranges;
        }

        ranges.sort_unstable();
        let mut out: Vec<Self> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match out.last_mut() {
                Some(last) if range.from <= last.to.saturating_add(1) => {
                    last.to = last.to.max(range.to);
                }
                _ => out.push(range),
            }
        }

        out
    }
}

impl fmt::Display for NumberRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.from, self.to)
    }
}

///
/// Value
///
/// An indexable attribute value. Ordering is total: type tag first, then
/// payload. Within one index every value shares the attribute's declared
/// type, so cross-type ordering only decides degenerate comparisons and
/// decimal values compare consistently because the schema fixes one scale
/// per attribute.
///

#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Decimal { unscaled: i64, scale: u8 },
    Text(String),
    Range(NumberRange),
    Array(Vec<Value>),
}

impl Value {
    #[must_use]
    pub const fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }

    /// The scalar elements this value contributes to an index: the value
    /// itself for scalars, the element list for arrays.
    #[must_use]
    pub fn elements(&self) -> &[Self] {
        match self {
            Self::Array(items) => items,
            scalar => slice::from_ref(scalar),
        }
    }

    #[must_use]
    pub const fn scalar_type(&self) -> Option<ValueType> {
        match self {
            Self::Bool(_) => Some(ValueType::Bool),
            Self::Int(_) => Some(ValueType::Int),
            Self::Decimal { .. } => Some(ValueType::Decimal),
            Self::Text(_) => Some(ValueType::Text),
            Self::Range(_) => Some(ValueType::NumberRange),
            Self::Array(_) => None,
        }
    }

    /// Whether this value (scalar, or array of scalars) conforms to the
    /// declared type. Nested arrays never conform.
    #[must_use]
    pub fn matches(&self, declared: ValueType) -> bool {
        match self {
            Self::Array(items) => items
                .iter()
                .all(|item| item.scalar_type() == Some(declared)),
            scalar => scalar.scalar_type() == Some(declared),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Decimal { unscaled, scale } => write!(f, "{unscaled}e-{scale}"),
            Self::Text(v) => write!(f, "{v}"),
            Self::Range(v) => write!(f, "{v}"),
            Self::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
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

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<NumberRange> for Value {
    fn from(v: NumberRange) -> Self {
        Self::Range(v)
    }
}
