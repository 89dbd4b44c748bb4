//! Filtering index: value histogram plus optional range sub-index.

mod range;

pub use range::{RangeIndex, RangeIndexError, RangePoint};

use crate::{
    RecordId,
    formula::Formula,
    key::AttributeKey,
    storage::{FilterIndexStoragePart, IndexKind, StoragePartKey},
    value::{NumberRange, Value, ValueType},
};
use parking_lot::Mutex;
use std::{ops::Bound, sync::Arc};
use tessera_tx::{
    CommittedLayers, TransactionalBitmap, TransactionalBool, TransactionalId, TransactionalMap,
    TransactionalProducer, registry,
};
use thiserror::Error as ThisError;

///
/// FilterIndexError
///

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum FilterIndexError {
    #[error("filter attribute {attribute} declared as {expected:?} cannot index value {value}")]
    InvalidValueShape {
        attribute: String,
        expected: ValueType,
        value: Value,
    },

    #[error("filter attribute {attribute}: record {record_id} is not registered for value {value}")]
    RecordNotRegistered {
        attribute: String,
        record_id: RecordId,
        value: Value,
    },

    #[error("filter attribute {attribute} is not a range type; range queries are not available")]
    RangeIndexNotAvailable { attribute: String },

    #[error(transparent)]
    Range(#[from] RangeIndexError),
}

///
/// FilterIndex
///
/// Histogram of distinct values in ascending order, each with the bucket
/// of record ids holding that value; the buckets partition the live
/// record set for the attribute key. Array values decompose into their
/// elements. Range-typed attributes additionally maintain a range
/// sub-index fed with per-record consolidated intervals, agreeing with
/// the histogram on which record ids are present overall.
///
/// Every read query returns a lazily computed [`Formula`] so predicates
/// can be composed before any set is materialized.
///

#[derive(Debug)]
pub struct FilterIndex {
    attribute_key: AttributeKey,
    value_type: ValueType,
    histogram: TransactionalMap<Value, TransactionalBitmap>,
    range_index: Option<RangeIndex>,
    // pure derived data: valid only while no mutation intervenes and no
    // transaction is active on the asking thread
    all_records_memo: Mutex<Option<Formula>>,
    dirty: TransactionalBool,
}

impl FilterIndex {
    #[must_use]
    pub fn new(attribute_key: AttributeKey, value_type: ValueType) -> Self {
        Self {
            attribute_key,
            value_type,
            histogram: TransactionalMap::new(),
            range_index: value_type.is_range().then(RangeIndex::new),
            all_records_memo: Mutex::new(None),
            dirty: TransactionalBool::default(),
        }
    }

    #[must_use]
    pub const fn attribute_key(&self) -> &AttributeKey {
        &self.attribute_key
    }

    // --- Mutation ---

    pub fn add_record(&mut self, record_id: RecordId, value: &Value) -> Result<(), FilterIndexError> {
        self.check_shape(value)?;

        for element in value.elements() {
            if !self.histogram.contains_key(element) {
                self.histogram
                    .insert(element.clone(), TransactionalBitmap::new());
            }
            self.histogram
                .with_value_mut(element, |bucket| bucket.insert(record_id));
        }

        if let Some(range_index) = &mut self.range_index {
            range_index.add_record(record_id, &Self::consolidated_ranges(value));
        }

        self.all_records_memo.lock().take();
        self.dirty.set(true);

        Ok(())
    }

    /// Remove a previously added value. Fails loudly, before any
    /// mutation, when the record is not registered for every element.
    pub fn remove_record(
        &mut self,
        record_id: RecordId,
        value: &Value,
    ) -> Result<(), FilterIndexError> {
        self.check_shape(value)?;

        for element in value.elements() {
            let present = self
                .histogram
                .with_value(element, |bucket| bucket.contains(record_id))
                .unwrap_or(false);
            if !present {
                return Err(FilterIndexError::RecordNotRegistered {
                    attribute: self.attribute_key.name.clone(),
                    record_id,
                    value: element.clone(),
                });
            }
        }

        // the range sub-index validates and mutates atomically, so run it
        // before the histogram is touched
        if let Some(range_index) = &mut self.range_index {
            range_index.remove_record(record_id, &Self::consolidated_ranges(value))?;
        }

        for element in value.elements() {
            let now_empty = self
                .histogram
                .with_value_mut(element, |bucket| {
                    bucket.remove(record_id);
                    bucket.is_empty()
                })
                .unwrap_or(false);
            if now_empty {
                self.histogram.remove(element);
            }
        }

        self.all_records_memo.lock().take();
        self.dirty.set(true);

        Ok(())
    }

    // --- Queries ---

    #[must_use]
    pub fn get_records_equal_to(&self, value: &Value) -> Formula {
        self.histogram
            .with_value(value, |bucket| {
                Formula::bitmaps(vec![bucket.snapshot()], [bucket.transactional_id()])
            })
            .unwrap_or_else(|| {
                // result flips non-empty only if the histogram itself changes
                Formula::empty_with_dependencies([self.histogram.transactional_id()])
            })
    }

    #[must_use]
    pub fn get_records_lesser_than(&self, value: &Value) -> Formula {
        self.buckets_formula((Bound::Unbounded, Bound::Excluded(value)))
    }

    #[must_use]
    pub fn get_records_lesser_than_eq(&self, value: &Value) -> Formula {
        self.buckets_formula((Bound::Unbounded, Bound::Included(value)))
    }

    #[must_use]
    pub fn get_records_greater_than(&self, value: &Value) -> Formula {
        self.buckets_formula((Bound::Excluded(value), Bound::Unbounded))
    }

    #[must_use]
    pub fn get_records_greater_than_eq(&self, value: &Value) -> Formula {
        self.buckets_formula((Bound::Included(value), Bound::Unbounded))
    }

    /// Records with a value in `[from, to]`, inclusive at both ends.
    #[must_use]
    pub fn get_records_between(&self, from: &Value, to: &Value) -> Formula {
        if from > to {
            return Formula::empty_with_dependencies([self.histogram.transactional_id()]);
        }

        self.buckets_formula((Bound::Included(from), Bound::Included(to)))
    }

    /// Union of all buckets. Memoized per index instance while no
    /// transaction is active on the asking thread; any untransacted
    /// mutation discards the memo, and a transacting thread always builds
    /// fresh because its visible content is thread-dependent.
    #[must_use]
    pub fn get_all_records_formula(&self) -> Formula {
        if registry::transaction_open() {
            return self.buckets_formula(..);
        }

        let mut memo = self.all_records_memo.lock();
        if let Some(formula) = memo.as_ref() {
            return formula.clone();
        }

        let formula = self.buckets_formula(..);
        *memo = Some(formula.clone());

        formula
    }

    /// Records with a range containing `point`; range-typed attributes
    /// only.
    pub fn get_records_valid_in(&self, point: i64) -> Result<Formula, FilterIndexError> {
        let range_index = self.range_index()?;
        let (bitmap, deps) = range_index.valid_in(point);

        Ok(Formula::constant(Arc::new(bitmap), deps))
    }

    /// Records with a range sharing at least one point with `[from, to]`;
    /// range-typed attributes only.
    pub fn get_records_overlapping(&self, from: i64, to: i64) -> Result<Formula, FilterIndexError> {
        let range_index = self.range_index()?;
        let (lo, hi) = if from <= to { (from, to) } else { (to, from) };
        let (bitmap, deps) = range_index.overlapping(lo, hi);

        Ok(Formula::constant(Arc::new(bitmap), deps))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    // --- Transaction plumbing ---

    pub fn apply_committed(&mut self, committed: &mut CommittedLayers) {
        // drain bucket layers before the histogram applies its removals,
        // so a bucket emptied and dropped inside the transaction does not
        // leave its layer behind
        if !committed.is_empty() {
            for value in self.histogram.visible_keys() {
                self.histogram
                    .with_value_mut(&value, |bucket| bucket.apply_committed(committed));
            }
        }

        self.histogram.apply_committed(committed);
        if let Some(range_index) = &mut self.range_index {
            range_index.apply_committed(committed);
        }
        self.dirty.apply_committed(committed);

        // buckets first inserted inside the transaction enter the base
        // only with the histogram layer above
        if !committed.is_empty() {
            for value in self.histogram.visible_keys() {
                self.histogram
                    .with_value_mut(&value, |bucket| bucket.apply_committed(committed));
            }
        }

        self.all_records_memo.lock().take();
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
    pub fn create_storage_part(&self, entity_index_pk: u32) -> FilterIndexStoragePart {
        let mut histogram = Vec::new();
        self.histogram.for_each_visible(|value, bucket| {
            histogram.push((value.clone(), (*bucket.snapshot()).clone()));
        });

        FilterIndexStoragePart {
            key: StoragePartKey {
                entity_index_pk,
                attribute_key: self.attribute_key.clone(),
                kind: IndexKind::Filter,
            },
            histogram,
            range_points: self.range_index.as_ref().map(RangeIndex::snapshot_points),
        }
    }

    // --- Internals ---

    fn buckets_formula<R>(&self, range: R) -> Formula
    where
        R: std::ops::RangeBounds<Value>,
    {
        let mut sources = Vec::new();
        let mut deps: Vec<TransactionalId> = vec![self.histogram.transactional_id()];
        self.histogram.for_each_in(range, |_, bucket| {
            deps.push(bucket.transactional_id());
            sources.push(bucket.snapshot());
        });

        if sources.is_empty() {
            Formula::empty_with_dependencies(deps)
        } else {
            Formula::bitmaps(sources, deps)
        }
    }

    fn range_index(&self) -> Result<&RangeIndex, FilterIndexError> {
        self.range_index
            .as_ref()
            .ok_or_else(|| FilterIndexError::RangeIndexNotAvailable {
                attribute: self.attribute_key.name.clone(),
            })
    }

    fn consolidated_ranges(value: &Value) -> Vec<NumberRange> {
        let ranges: Vec<NumberRange> = value
            .elements()
            .iter()
            .filter_map(|element| match element {
                Value::Range(range) => Some(*range),
                _ => None,
            })
            .collect();

        NumberRange::consolidate(ranges)
    }

    fn check_shape(&self, value: &Value) -> Result<(), FilterIndexError> {
        if value.matches(self.value_type) {
            Ok(())
        } else {
            Err(FilterIndexError::InvalidValueShape {
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

    fn text_index() -> FilterIndex {
        FilterIndex::new(AttributeKey::global("color"), ValueType::Text)
    }

    fn int_index() -> FilterIndex {
        FilterIndex::new(AttributeKey::global("size"), ValueType::Int)
    }

    #[test]
    fn equal_to_reflects_add_and_remove() {
        let mut ix = text_index();
        ix.add_record(1, &Value::from("red")).unwrap();
        ix.add_record(2, &Value::from("red")).unwrap();
        ix.remove_record(1, &Value::from("red")).unwrap();

        assert_eq!(
            ix.get_records_equal_to(&Value::from("red")).compute_to_vec(),
            vec![2]
        );
    }

    #[test]
    fn histogram_buckets_partition_the_live_set() {
        let mut ix = int_index();
        ix.add_record(1, &Value::Int(10)).unwrap();
        ix.add_record(2, &Value::Int(20)).unwrap();
        ix.add_record(3, &Value::Int(20)).unwrap();
        ix.add_record(4, &Value::Int(30)).unwrap();
        ix.remove_record(2, &Value::Int(20)).unwrap();

        assert_eq!(ix.get_all_records_formula().compute_to_vec(), vec![1, 3, 4]);
        assert_eq!(
            ix.get_records_equal_to(&Value::Int(20)).compute_to_vec(),
            vec![3]
        );
    }

    #[test]
    fn array_values_register_each_element() {
        let mut ix = text_index();
        let value = Value::Array(vec![Value::from("red"), Value::from("blue")]);
        ix.add_record(7, &value).unwrap();

        assert_eq!(
            ix.get_records_equal_to(&Value::from("red")).compute_to_vec(),
            vec![7]
        );
        assert_eq!(
            ix.get_records_equal_to(&Value::from("blue")).compute_to_vec(),
            vec![7]
        );

        ix.remove_record(7, &value).unwrap();
        assert!(ix.is_empty());
    }

    #[test]
    fn comparison_queries_collect_matching_buckets() {
        let mut ix = int_index();
        ix.add_record(1, &Value::Int(10)).unwrap();
        ix.add_record(2, &Value::Int(20)).unwrap();
        ix.add_record(3, &Value::Int(30)).unwrap();

        assert_eq!(
            ix.get_records_lesser_than(&Value::Int(20)).compute_to_vec(),
            vec![1]
        );
        assert_eq!(
            ix.get_records_lesser_than_eq(&Value::Int(20)).compute_to_vec(),
            vec![1, 2]
        );
        assert_eq!(
            ix.get_records_greater_than(&Value::Int(20)).compute_to_vec(),
            vec![3]
        );
        assert_eq!(
            ix.get_records_greater_than_eq(&Value::Int(20)).compute_to_vec(),
            vec![2, 3]
        );
        assert_eq!(
            ix.get_records_between(&Value::Int(10), &Value::Int(20))
                .compute_to_vec(),
            vec![1, 2]
        );
        assert!(
            ix.get_records_between(&Value::Int(25), &Value::Int(15))
                .compute()
                .is_empty()
        );
    }

    #[test]
    fn removing_an_unregistered_record_fails_loudly() {
        let mut ix = text_index();
        ix.add_record(1, &Value::from("red")).unwrap();

        let err = ix.remove_record(2, &Value::from("red")).unwrap_err();
        assert!(matches!(err, FilterIndexError::RecordNotRegistered { record_id: 2, .. }));
    }

    #[test]
    fn range_queries_fail_on_non_range_attribute() {
        let ix = text_index();
        let err = ix.get_records_valid_in(5).unwrap_err();
        assert!(matches!(err, FilterIndexError::RangeIndexNotAvailable { .. }));
    }

    #[test]
    fn range_attribute_answers_point_and_overlap_queries() {
        let mut ix = FilterIndex::new(AttributeKey::global("validity"), ValueType::NumberRange);
        let r = |from, to| Value::Range(NumberRange::new(from, to).unwrap());
        ix.add_record(1, &r(1, 5)).unwrap();
        ix.add_record(2, &r(4, 9)).unwrap();

        assert_eq!(ix.get_records_valid_in(4).unwrap().compute_to_vec(), vec![1, 2]);
        assert_eq!(ix.get_records_valid_in(7).unwrap().compute_to_vec(), vec![2]);
        assert_eq!(
            ix.get_records_overlapping(5, 6).unwrap().compute_to_vec(),
            vec![1, 2]
        );
        assert_eq!(
            ix.get_records_overlapping(10, 12).unwrap().compute_to_vec(),
            Vec::<u32>::new()
        );
    }

    #[test]
    fn overlapping_range_elements_consolidate_before_range_registration() {
        let mut ix = FilterIndex::new(AttributeKey::global("validity"), ValueType::NumberRange);
        let value = Value::Array(vec![
            Value::Range(NumberRange::new(1, 3).unwrap()),
            Value::Range(NumberRange::new(3, 6).unwrap()),
        ]);
        ix.add_record(1, &value).unwrap();

        assert_eq!(ix.get_records_valid_in(4).unwrap().compute_to_vec(), vec![1]);
        ix.remove_record(1, &value).unwrap();
        assert!(ix.is_empty());
        assert!(ix.get_records_valid_in(4).unwrap().compute().is_empty());
    }

    #[test]
    fn all_records_memo_survives_reads_and_dies_on_mutation() {
        let mut ix = text_index();
        ix.add_record(1, &Value::from("red")).unwrap();

        let first = ix.get_all_records_formula();
        let second = ix.get_all_records_formula();
        assert_eq!(first.structural_hash(), second.structural_hash());

        ix.add_record(2, &Value::from("blue")).unwrap();
        let third = ix.get_all_records_formula();
        assert_eq!(third.compute_to_vec(), vec![1, 2]);
    }

    #[test]
    fn all_records_memo_is_skipped_inside_a_transaction() {
        let mut ix = text_index();
        ix.add_record(1, &Value::from("red")).unwrap();
        let committed_view = ix.get_all_records_formula();

        begin_transaction().unwrap();
        ix.add_record(2, &Value::from("blue")).unwrap();
        assert_eq!(ix.get_all_records_formula().compute_to_vec(), vec![1, 2]);
        rollback().unwrap();

        assert_eq!(committed_view.compute_to_vec(), vec![1]);
        assert_eq!(ix.get_all_records_formula().compute_to_vec(), vec![1]);
    }

    #[test]
    fn transactional_filter_mutations_commit_and_roll_back() {
        let mut ix = text_index();
        ix.add_record(1, &Value::from("red")).unwrap();

        begin_transaction().unwrap();
        ix.add_record(2, &Value::from("red")).unwrap();
        ix.remove_record(1, &Value::from("red")).unwrap();
        rollback().unwrap();
        assert_eq!(
            ix.get_records_equal_to(&Value::from("red")).compute_to_vec(),
            vec![1]
        );

        begin_transaction().unwrap();
        ix.add_record(2, &Value::from("red")).unwrap();
        let mut committed = commit().unwrap();
        ix.apply_committed(&mut committed);
        assert_eq!(
            ix.get_records_equal_to(&Value::from("red")).compute_to_vec(),
            vec![1, 2]
        );
    }
}
