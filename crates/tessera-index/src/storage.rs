//! Value-level storage parts handed to the persistence collaborator.
//!
//! A storage part is a point-in-time snapshot of one index's visible
//! content, addressed by `(entity index primary key, attribute key,
//! index kind)`. The on-disk byte layout is owned by the persistence
//! collaborator; these types only fix what gets flushed.

use crate::{
    RecordId,
    key::AttributeKey,
    value::Value,
};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

///
/// IndexKind
///

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum IndexKind {
    Unique,
    Filter,
    Sort,
}

///
/// StoragePartKey
///

#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct StoragePartKey {
    pub entity_index_pk: u32,
    pub attribute_key: AttributeKey,
    pub kind: IndexKind,
}

///
/// UniqueIndexStoragePart
///

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UniqueIndexStoragePart {
    pub key: StoragePartKey,
    pub pairs: Vec<(Value, RecordId)>,
    pub record_ids: RoaringBitmap,
}

///
/// FilterIndexStoragePart
///

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FilterIndexStoragePart {
    pub key: StoragePartKey,
    /// Distinct values ascending, each with its record-id bucket.
    pub histogram: Vec<(Value, RoaringBitmap)>,
    /// Range thresholds ascending with (starts, ends) bitmaps; present
    /// only for range-typed attributes.
    pub range_points: Option<Vec<(i64, RoaringBitmap, RoaringBitmap)>>,
}

///
/// SortIndexStoragePart
///

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SortIndexStoragePart {
    pub key: StoragePartKey,
    /// Record ids ordered by (value, record id).
    pub sorted_records: Vec<RecordId>,
    /// Distinct values ascending.
    pub sorted_values: Vec<Value>,
    /// Cardinalities for values held by more than one record.
    pub value_cardinalities: Vec<(Value, u32)>,
}

///
/// StoragePart
///
/// One dirty index's snapshot, as aggregated by the attribute container.
///

#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum StoragePart {
    Unique(UniqueIndexStoragePart),
    Filter(FilterIndexStoragePart),
    Sort(SortIndexStoragePart),
}

impl StoragePart {
    #[must_use]
    pub const fn key(&self) -> &StoragePartKey {
        match self {
            Self::Unique(part) => &part.key,
            Self::Filter(part) => &part.key,
            Self::Sort(part) => &part.key,
        }
    }
}
