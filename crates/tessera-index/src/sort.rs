//! Sort index: global record order by attribute value.

use crate::{
    RecordId,
    key::AttributeKey,
    storage::{IndexKind, SortIndexStoragePart, StoragePartKey},
    value::{Value, ValueType},
};
use parking_lot::Mutex;
use std::sync::Arc;
use tessera_tx::{
    CommittedLayers, TransactionalBool, TransactionalMap, TransactionalProducer, TransactionalVec,
    TxId, registry,
};
use thiserror::Error as ThisError;

///
/// SortIndexError
///

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum SortIndexError {
    #[error("sort attribute {attribute} declared as {expected:?} cannot index value {value}")]
    InvalidValueShape {
        attribute: String,
        expected: ValueType,
        value: Value,
    },

    #[error("sort attribute {attribute}: record {record_id} is already registered")]
    RecordAlreadyRegistered {
        attribute: String,
        record_id: RecordId,
    },

    #[error("sort attribute {attribute}: record {record_id} is not registered under value {value}")]
    OwnershipMismatch {
        attribute: String,
        value: Value,
        record_id: RecordId,
    },
}

// Derived value-start index: (value, first offset) per distinct value,
// tagged with the transaction context it was built under so a cache
// populated inside a transaction can never be served after rollback.
struct ValueStartCache {
    built_under: Option<TxId>,
    starts: Arc<Vec<(Value, usize)>>,
}

///
/// SortIndex
///
/// Authoritative state is the record array ordered by (value, record id),
/// the distinct values in ascending order, and the cardinality map
/// (entries only for values held by more than one record; absent means
/// one). The value-start index is pure derived data rebuilt on demand:
/// it turns an insertion into two binary searches instead of a rescan of
/// the whole record array.
///

#[derive(Debug)]
pub struct SortIndex {
    attribute_key: AttributeKey,
    value_type: ValueType,
    sorted_records: TransactionalVec<RecordId>,
    sorted_values: TransactionalVec<Value>,
    value_cardinalities: TransactionalMap<Value, u32>,
    value_starts: Mutex<Option<ValueStartCache>>,
    dirty: TransactionalBool,
}

impl std::fmt::Debug for ValueStartCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueStartCache")
            .field("built_under", &self.built_under)
            .field("distinct_values", &self.starts.len())
            .finish()
    }
}

impl SortIndex {
    #[must_use]
    pub fn new(attribute_key: AttributeKey, value_type: ValueType) -> Self {
        Self {
            attribute_key,
            value_type,
            sorted_records: TransactionalVec::new(),
            sorted_values: TransactionalVec::new(),
            value_cardinalities: TransactionalMap::new(),
            value_starts: Mutex::new(None),
            dirty: TransactionalBool::default(),
        }
    }

    #[must_use]
    pub const fn attribute_key(&self) -> &AttributeKey {
        &self.attribute_key
    }

    // --- Mutation ---

    pub fn add_record(&mut self, value: &Value, record_id: RecordId) -> Result<(), SortIndexError> {
        self.check_shape(value)?;

        let starts = self.value_starts();
        match starts.binary_search_by(|(known, _)| known.cmp(value)) {
            Ok(position) => {
                // existing value: place the record inside its contiguous,
                // record-id-ordered block
                let block_start = starts[position].1;
                let cardinality = self.cardinality_of(value);
                let records = self.sorted_records.snapshot();
                let block = &records[block_start..block_start + cardinality];
                match block.binary_search(&record_id) {
                    Ok(_) => {
                        return Err(SortIndexError::RecordAlreadyRegistered {
                            attribute: self.attribute_key.name.clone(),
                            record_id,
                        });
                    }
                    Err(offset) => {
                        self.sorted_records.insert_at(block_start + offset, record_id);
                        self.value_cardinalities
                            .insert(value.clone(), u32::try_from(cardinality).unwrap_or(1) + 1);
                    }
                }
            }
            Err(position) => {
                // new distinct value: insertion point is the neighbouring
                // block boundary
                let offset = starts
                    .get(position)
                    .map_or_else(|| self.sorted_records.len(), |entry| entry.1);
                self.sorted_values.insert_at(position, value.clone());
                self.sorted_records.insert_at(offset, record_id);
            }
        }

        self.invalidate_value_starts();
        self.dirty.set(true);

        Ok(())
    }

    pub fn remove_record(
        &mut self,
        value: &Value,
        record_id: RecordId,
    ) -> Result<(), SortIndexError> {
        self.check_shape(value)?;

        let mismatch = || SortIndexError::OwnershipMismatch {
            attribute: self.attribute_key.name.clone(),
            value: value.clone(),
            record_id,
        };

        let starts = self.value_starts();
        let position = starts
            .binary_search_by(|(known, _)| known.cmp(value))
            .map_err(|_| mismatch())?;
        let block_start = starts[position].1;
        let cardinality = self.cardinality_of(value);
        let records = self.sorted_records.snapshot();
        let block = &records[block_start..block_start + cardinality];
        let offset = block.binary_search(&record_id).map_err(|_| mismatch())?;

        self.sorted_records.remove_at(block_start + offset);
        match cardinality {
            1 => {
                self.sorted_values.remove_at(position);
            }
            2 => {
                self.value_cardinalities.remove(value);
            }
            n => {
                self.value_cardinalities
                    .insert(value.clone(), u32::try_from(n).unwrap_or(2) - 1);
            }
        }

        self.invalidate_value_starts();
        self.dirty.set(true);

        Ok(())
    }

    // --- Reads ---

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sorted_records.is_empty()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.sorted_records.len()
    }

    /// Records in ascending (value, record id) order.
    #[must_use]
    pub fn get_ascending_order_records_supplier(&self) -> SortedRecordsSupplier {
        SortedRecordsSupplier {
            records: self.sorted_records.snapshot(),
            descending: false,
        }
    }

    /// Records in descending value order, derived by inverting position
    /// lookups over the ascending snapshot; nothing is re-sorted.
    #[must_use]
    pub fn get_descending_order_records_supplier(&self) -> SortedRecordsSupplier {
        SortedRecordsSupplier {
            records: self.sorted_records.snapshot(),
            descending: true,
        }
    }

    // --- Transaction plumbing ---

    pub fn apply_committed(&mut self, committed: &mut CommittedLayers) {
        self.sorted_records.apply_committed(committed);
        self.sorted_values.apply_committed(committed);
        self.value_cardinalities.apply_committed(committed);
        self.dirty.apply_committed(committed);
        self.invalidate_value_starts();
    }

    // --- Persistence surface ---

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    pub fn reset_dirty(&mut self) {
        self.dirty.set(false);
    }

    #[must_use]
    pub fn create_storage_part(&self, entity_index_pk: u32) -> SortIndexStoragePart {
        let mut value_cardinalities = Vec::new();
        self.value_cardinalities
            .for_each_visible(|value, cardinality| {
                value_cardinalities.push((value.clone(), *cardinality));
            });

        SortIndexStoragePart {
            key: StoragePartKey {
                entity_index_pk,
                attribute_key: self.attribute_key.clone(),
                kind: IndexKind::Sort,
            },
            sorted_records: (*self.sorted_records.snapshot()).clone(),
            sorted_values: (*self.sorted_values.snapshot()).clone(),
            value_cardinalities,
        }
    }

    // --- Internals ---

    fn value_starts(&self) -> Arc<Vec<(Value, usize)>> {
        let current_tx = registry::current_transaction();
        let mut guard = self.value_starts.lock();
        if let Some(cache) = guard.as_ref() {
            if cache.built_under == current_tx {
                return Arc::clone(&cache.starts);
            }
        }

        let values = self.sorted_values.snapshot();
        let mut starts = Vec::with_capacity(values.len());
        let mut offset = 0usize;
        for value in values.iter() {
            starts.push((value.clone(), offset));
            offset += self.cardinality_of(value);
        }

        let starts = Arc::new(starts);
        *guard = Some(ValueStartCache {
            built_under: current_tx,
            starts: Arc::clone(&starts),
        });

        starts
    }

    fn invalidate_value_starts(&self) {
        self.value_starts.lock().take();
    }

    fn cardinality_of(&self, value: &Value) -> usize {
        self.value_cardinalities.get(value).unwrap_or(1) as usize
    }

    fn check_shape(&self, value: &Value) -> Result<(), SortIndexError> {
        if value.is_array() || !value.matches(self.value_type) {
            return Err(SortIndexError::InvalidValueShape {
                attribute: self.attribute_key.name.clone(),
                expected: self.value_type,
                value: value.clone(),
            });
        }

        Ok(())
    }
}

///
/// SortedRecordsSupplier
///
/// Read-only view over one snapshot of the sorted record array.
///

#[derive(Clone, Debug)]
pub struct SortedRecordsSupplier {
    records: Arc<Vec<RecordId>>,
    descending: bool,
}

impl SortedRecordsSupplier {
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn record_at(&self, position: usize) -> Option<RecordId> {
        if position >= self.records.len() {
            return None;
        }

        let index = if self.descending {
            self.records.len() - 1 - position
        } else {
            position
        };

        self.records.get(index).copied()
    }

    #[must_use]
    pub fn position_of(&self, record_id: RecordId) -> Option<usize> {
        let ascending = self.records.iter().position(|id| *id == record_id)?;

        Some(if self.descending {
            self.records.len() - 1 - ascending
        } else {
            ascending
        })
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = RecordId> + '_> {
        if self.descending {
            Box::new(self.records.iter().rev().copied())
        } else {
            Box::new(self.records.iter().copied())
        }
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<RecordId> {
        self.iter().collect()
    }
}
