use crate::value::ValueType;
use derive_more::{Deref, Display};
use serde::{Deserialize, Serialize};
use std::fmt;

///
/// Locale
///

#[derive(
    Clone, Debug, Deref, Deserialize, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct Locale(String);

impl Locale {
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

///
/// AttributeKey
///
/// Identifies one indexed value slot: attribute name plus, for localized
/// attributes, the locale the value was registered under. Equality and
/// ordering are structural.
///

#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct AttributeKey {
    pub name: String,
    pub locale: Option<Locale>,
}

impl AttributeKey {
    #[must_use]
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locale: None,
        }
    }

    #[must_use]
    pub fn localized(name: impl Into<String>, locale: Locale) -> Self {
        Self {
            name: name.into(),
            locale: Some(locale),
        }
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.locale {
            Some(locale) => write!(f, "{}:{locale}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

///
/// AttributeSchema
///
/// The trusted per-attribute contract supplied by the schema
/// collaborator. The indexes act on these flags and do not validate
/// schema evolution rules themselves.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AttributeSchema {
    pub name: String,
    pub value_type: ValueType,
    pub unique: bool,
    pub filterable: bool,
    pub sortable: bool,
    pub localized: bool,
    /// For decimal attributes, the number of decimal places the index
    /// discriminates; ignored for every other type.
    pub indexed_decimal_places: u8,
}

impl AttributeSchema {
    #[must_use]
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            unique: false,
            filterable: false,
            sortable: false,
            localized: false,
            indexed_decimal_places: 0,
        }
    }

    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    #[must_use]
    pub const fn filterable(mut self) -> Self {
        self.filterable = true;
        self
    }

    #[must_use]
    pub const fn sortable(mut self) -> Self {
        self.sortable = true;
        self
    }

    #[must_use]
    pub const fn localized(mut self) -> Self {
        self.localized = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_keys_compare_structurally() {
        let en = AttributeKey::localized("name", Locale::new("en"));
        let en_again = AttributeKey::localized("name", Locale::new("en"));
        let cs = AttributeKey::localized("name", Locale::new("cs"));
        let global = AttributeKey::global("name");

        assert_eq!(en, en_again);
        assert_ne!(en, cs);
        assert_ne!(en, global);
    }
}
