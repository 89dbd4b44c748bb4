//! Attribute indexes and bitmap query evaluation for Tessera.
//!
//! Per scalar or array attribute of an entity type this crate maintains
//! uniqueness, filtering/range and sort-order structures, all built on
//! the transactional containers of `tessera-tx`, and composes their query
//! results through a lazily evaluated, memoizable formula algebra over
//! roaring bitmaps of record ids.

pub mod attribute;
pub mod filter;
pub mod formula;
pub mod key;
pub mod sort;
pub mod storage;
pub mod unique;
pub mod value;

/// Dense identifier of one entity within its collection; the unit every
/// index and bitmap stores.
pub type RecordId = u32;

pub mod prelude {
    pub use crate::{
        RecordId,
        attribute::AttributeIndex,
        filter::FilterIndex,
        formula::Formula,
        key::{AttributeKey, AttributeSchema, Locale},
        sort::SortIndex,
        unique::UniqueIndex,
        value::{NumberRange, Value, ValueType},
    };
}
