use crate::{
    RecordId,
    formula::Formula,
    key::AttributeKey,
    storage::{IndexKind, StoragePartKey, UniqueIndexStoragePart},
    value::{Value, ValueType},
};
use tessera_tx::{
    CommittedLayers, TransactionalBitmap, TransactionalBool, TransactionalMap,
    TransactionalProducer,
};
use thiserror::Error as ThisError;

///
/// UniqueIndexError
///

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum UniqueIndexError {
    #[error(
        "unique attribute {attribute}: value {value} is already bound to record {existing}, cannot bind record {attempted}"
    )]
    UniqueValueViolation {
        attribute: String,
        value: Value,
        existing: RecordId,
        attempted: RecordId,
    },

    #[error(
        "unique attribute {attribute}: value {value} is not owned by record {expected} (bound to {actual:?})"
    )]
    OwnershipMismatch {
        attribute: String,
        value: Value,
        expected: RecordId,
        actual: Option<RecordId>,
    },

    #[error("unique attribute {attribute} declared as {expected:?} cannot index value {value}")]
    InvalidValueShape {
        attribute: String,
        expected: ValueType,
        value: Value,
    },
}

///
/// UniqueIndex
///
/// Bijective value-to-record mapping for one attribute key. Every value
/// maps to at most one live record id; every record id in the tracked
/// id-set owns at least one value. Array-valued attributes bind each
/// element independently, validated in full before any element mutates,
/// so a failed call never leaves a partial registration behind.
///

#[derive(Debug)]
pub struct UniqueIndex {
    attribute_key: AttributeKey,
    value_type: ValueType,
    unique_map: TransactionalMap<Value, RecordId>,
    record_ids: TransactionalBitmap,
    // how many values each record currently owns; a record leaves the
    // id-set only when its last value is unregistered
    record_value_counts: TransactionalMap<RecordId, u32>,
    dirty: TransactionalBool,
}

impl UniqueIndex {
    #[must_use]
    pub fn new(attribute_key: AttributeKey, value_type: ValueType) -> Self {
        Self {
            attribute_key,
            value_type,
            unique_map: TransactionalMap::new(),
            record_ids: TransactionalBitmap::new(),
            record_value_counts: TransactionalMap::new(),
            dirty: TransactionalBool::default(),
        }
    }

    #[must_use]
    pub const fn attribute_key(&self) -> &AttributeKey {
        &self.attribute_key
    }

    // --- Mutation ---

    /// Bind `value` (scalar, or each element of an array) to `record_id`.
    ///
    /// Re-registering an existing (value, record) pair is a no-op
    /// success; a value bound to a different record fails the whole call
    /// before anything mutates.
    pub fn register_unique_key(
        &mut self,
        value: &Value,
        record_id: RecordId,
    ) -> Result<(), UniqueIndexError> {
        self.check_shape(value)?;

        // validate every element before mutating any of them
        for element in value.elements() {
            if let Some(existing) = self.unique_map.get(element) {
                if existing != record_id {
                    return Err(UniqueIndexError::UniqueValueViolation {
                        attribute: self.attribute_key.name.clone(),
                        value: element.clone(),
                        existing,
                        attempted: record_id,
                    });
                }
            }
        }

        for element in value.elements() {
            if self.unique_map.get(element).is_none() {
                self.unique_map.insert(element.clone(), record_id);
                let owned = self.record_value_counts.get(&record_id).unwrap_or(0);
                self.record_value_counts.insert(record_id, owned + 1);
                if owned == 0 {
                    self.record_ids.insert(record_id);
                }
            }
        }
        self.dirty.set(true);

        Ok(())
    }

    /// Unbind `value` from `record_id`. Every element must currently be
    /// owned by `record_id`, checked in full before any mutation.
    pub fn unregister_unique_key(
        &mut self,
        value: &Value,
        record_id: RecordId,
    ) -> Result<(), UniqueIndexError> {
        self.check_shape(value)?;

        for element in value.elements() {
            let actual = self.unique_map.get(element);
            if actual != Some(record_id) {
                return Err(UniqueIndexError::OwnershipMismatch {
                    attribute: self.attribute_key.name.clone(),
                    value: element.clone(),
                    expected: record_id,
                    actual,
                });
            }
        }

        for element in value.elements() {
            // duplicate array elements unbind once
            if !self.unique_map.remove(element) {
                continue;
            }

            let owned = self.record_value_counts.get(&record_id).unwrap_or(1);
            if owned <= 1 {
                self.record_value_counts.remove(&record_id);
                self.record_ids.remove(record_id);
            } else {
                self.record_value_counts.insert(record_id, owned - 1);
            }
        }
        self.dirty.set(true);

        Ok(())
    }

    // --- Reads ---

    #[must_use]
    pub fn get_record_id_by(&self, value: &Value) -> Option<RecordId> {
        self.unique_map.get(value)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unique_map.is_empty()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.unique_map.len()
    }

    /// All record ids owning at least one value, as a formula leaf tagged
    /// with this index's id-set producer.
    #[must_use]
    pub fn get_record_ids_formula(&self) -> Formula {
        Formula::constant(
            self.record_ids.snapshot(),
            [self.record_ids.transactional_id()],
        )
    }

    // --- Transaction plumbing ---

    pub fn apply_committed(&mut self, committed: &mut CommittedLayers) {
        self.unique_map.apply_committed(committed);
        self.record_ids.apply_committed(committed);
        self.record_value_counts.apply_committed(committed);
        self.dirty.apply_committed(committed);
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
    pub fn create_storage_part(&self, entity_index_pk: u32) -> UniqueIndexStoragePart {
        let mut pairs = Vec::with_capacity(self.unique_map.len());
        self.unique_map
            .for_each_visible(|value, record| pairs.push((value.clone(), *record)));

        UniqueIndexStoragePart {
            key: StoragePartKey {
                entity_index_pk,
                attribute_key: self.attribute_key.clone(),
                kind: IndexKind::Unique,
            },
            pairs,
            record_ids: (*self.record_ids.snapshot()).clone(),
        }
    }

    fn check_shape(&self, value: &Value) -> Result<(), UniqueIndexError> {
        if value.matches(self.value_type) {
            Ok(())
        } else {
            Err(UniqueIndexError::InvalidValueShape {
                attribute: self.attribute_key.name.clone(),
                expected: self.value_type,
                value: value.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_tx::registry::{begin_transaction, commit, rollback};

    fn index() -> UniqueIndex {
        UniqueIndex::new(AttributeKey::global("sku"), ValueType::Text)
    }

    #[test]
    fn register_then_lookup() {
        let mut ix = index();
        ix.register_unique_key(&Value::from("sku-1"), 42).unwrap();

        assert_eq!(ix.get_record_id_by(&Value::from("sku-1")), Some(42));
        assert!(!ix.is_empty());
        assert_eq!(ix.get_record_ids_formula().compute_to_vec(), vec![42]);
    }

    #[test]
    fn second_record_for_bound_value_fails_without_mutation() {
        let mut ix = index();
        ix.register_unique_key(&Value::from("sku-1"), 42).unwrap();

        let err = ix.register_unique_key(&Value::from("sku-1"), 99).unwrap_err();
        assert!(matches!(
            err,
            UniqueIndexError::UniqueValueViolation { existing: 42, attempted: 99, .. }
        ));
        assert_eq!(ix.get_record_id_by(&Value::from("sku-1")), Some(42));
    }

    #[test]
    fn reregistering_the_same_pair_is_a_noop_success() {
        let mut ix = index();
        ix.register_unique_key(&Value::from("sku-1"), 42).unwrap();
        ix.register_unique_key(&Value::from("sku-1"), 42).unwrap();

        assert_eq!(ix.size(), 1);
    }

    #[test]
    fn array_registration_is_all_or_nothing() {
        let mut ix = index();
        ix.register_unique_key(&Value::from("b"), 7).unwrap();

        let array = Value::Array(vec![Value::from("a"), Value::from("b")]);
        let err = ix.register_unique_key(&array, 8).unwrap_err();
        assert!(matches!(err, UniqueIndexError::UniqueValueViolation { .. }));

        // "a" must not have been bound by the failed call
        assert_eq!(ix.get_record_id_by(&Value::from("a")), None);
    }

    #[test]
    fn record_stays_in_id_set_until_last_value_is_removed() {
        let mut ix = index();
        let array = Value::Array(vec![Value::from("a"), Value::from("b")]);
        ix.register_unique_key(&array, 7).unwrap();

        ix.unregister_unique_key(&Value::from("a"), 7).unwrap();
        assert_eq!(ix.get_record_ids_formula().compute_to_vec(), vec![7]);

        ix.unregister_unique_key(&Value::from("b"), 7).unwrap();
        assert!(ix.get_record_ids_formula().compute().is_empty());
        assert!(ix.is_empty());
    }

    #[test]
    fn unregister_with_wrong_owner_fails_loudly() {
        let mut ix = index();
        ix.register_unique_key(&Value::from("sku-1"), 42).unwrap();

        let err = ix.unregister_unique_key(&Value::from("sku-1"), 43).unwrap_err();
        assert!(matches!(
            err,
            UniqueIndexError::OwnershipMismatch { expected: 43, actual: Some(42), .. }
        ));
        assert_eq!(ix.get_record_id_by(&Value::from("sku-1")), Some(42));
    }

    #[test]
    fn wrong_value_shape_is_rejected() {
        let mut ix = index();
        let err = ix.register_unique_key(&Value::Int(3), 1).unwrap_err();
        assert!(matches!(err, UniqueIndexError::InvalidValueShape { .. }));
    }

    #[test]
    fn transactional_registration_rolls_back_cleanly() {
        let mut ix = index();
        ix.register_unique_key(&Value::from("keep"), 1).unwrap();

        begin_transaction().unwrap();
        ix.register_unique_key(&Value::from("gone"), 2).unwrap();
        assert_eq!(ix.get_record_id_by(&Value::from("gone")), Some(2));
        rollback().unwrap();

        assert_eq!(ix.get_record_id_by(&Value::from("gone")), None);
        assert_eq!(ix.size(), 1);
    }

    #[test]
    fn transactional_registration_commits() {
        let mut ix = index();

        begin_transaction().unwrap();
        ix.register_unique_key(&Value::from("sku-9"), 9).unwrap();
        let mut committed = commit().unwrap();
        ix.apply_committed(&mut committed);

        assert_eq!(ix.get_record_id_by(&Value::from("sku-9")), Some(9));
        assert!(ix.is_dirty());
    }

    #[test]
    fn storage_part_reflects_visible_content() {
        let mut ix = index();
        ix.register_unique_key(&Value::from("x"), 3).unwrap();
        ix.register_unique_key(&Value::from("y"), 4).unwrap();

        let part = ix.create_storage_part(11);
        assert_eq!(part.key.entity_index_pk, 11);
        assert_eq!(part.pairs.len(), 2);
        assert_eq!(part.record_ids.iter().collect::<Vec<_>>(), vec![3, 4]);
    }
}
