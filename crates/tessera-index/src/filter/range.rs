use crate::{
    RecordId,
    value::NumberRange,
};
use roaring::RoaringBitmap;
use std::collections::BTreeSet;
use tessera_tx::{
    CommittedLayers, TransactionalBitmap, TransactionalId, TransactionalMap,
    TransactionalProducer,
};
use thiserror::Error as ThisError;

///
/// RangeIndexError
///

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum RangeIndexError {
    #[error("record {record_id} is not registered for range {range}")]
    RangeNotRegistered {
        record_id: RecordId,
        range: NumberRange,
    },
}

///
/// RangePoint
///
/// Record ids whose ranges start or end at one threshold.
///

#[derive(Debug, Default)]
pub struct RangePoint {
    starts: TransactionalBitmap,
    ends: TransactionalBitmap,
}

///
/// RangeIndex
///
/// Interval index over consolidated `[from, to]` pairs. Callers must
/// consolidate a record's ranges before registration (the filter index
/// does), which guarantees per record that ranges are disjoint and
/// non-adjacent; the sweep in `valid_in` relies on that to handle a
/// record closing one range and reopening a later one.
///

#[derive(Debug, Default)]
pub struct RangeIndex {
    points: TransactionalMap<i64, RangePoint>,
}

impl RangeIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            points: TransactionalMap::new(),
        }
    }

    // --- Mutation ---

    pub fn add_record(&mut self, record_id: RecordId, ranges: &[NumberRange]) {
        for range in ranges {
            self.point_insert(range.from(), record_id, true);
            self.point_insert(range.to(), record_id, false);
        }
    }

    /// Remove previously registered ranges; every (threshold, record)
    /// membership is validated before any mutation.
    pub fn remove_record(
        &mut self,
        record_id: RecordId,
        ranges: &[NumberRange],
    ) -> Result<(), RangeIndexError> {
        for range in ranges {
            let start_ok = self
                .points
                .with_value(&range.from(), |point| point.starts.contains(record_id))
                .unwrap_or(false);
            let end_ok = self
                .points
                .with_value(&range.to(), |point| point.ends.contains(record_id))
                .unwrap_or(false);
            if !start_ok || !end_ok {
                return Err(RangeIndexError::RangeNotRegistered { record_id, range: *range });
            }
        }

        for range in ranges {
            self.point_remove(range.from(), record_id, true);
            self.point_remove(range.to(), record_id, false);
        }

        Ok(())
    }

    // --- Queries ---

    /// Records with some range containing `point`, inclusive both ends.
    ///
    /// Ordered sweep: a start at threshold `p <= point` opens the record,
    /// an end at `p < point` closes it again. Starts fold before ends at
    /// an equal threshold so a single-point range `[p, p]` opens first
    /// and is then closed only when `p < point`.
    #[must_use]
    pub fn valid_in(&self, point: i64) -> (RoaringBitmap, BTreeSet<TransactionalId>) {
        let mut open = RoaringBitmap::new();
        let mut deps = BTreeSet::new();
        deps.insert(self.points.transactional_id());

        self.points.for_each_in(..=point, |threshold, range_point| {
            deps.insert(range_point.starts.transactional_id());
            deps.insert(range_point.ends.transactional_id());
            open |= range_point.starts.snapshot().as_ref();
            if *threshold < point {
                open -= range_point.ends.snapshot().as_ref();
            }
        });

        (open, deps)
    }

    /// Records with some range sharing at least one point with
    /// `[from, to]`: those already valid at `from`, plus those whose
    /// range starts inside `(from, to]`.
    #[must_use]
    pub fn overlapping(
        &self,
        from: i64,
        to: i64,
    ) -> (RoaringBitmap, BTreeSet<TransactionalId>) {
        let (mut result, mut deps) = self.valid_in(from);

        if from < to {
            self.points.for_each_in(from.saturating_add(1)..=to, |_, range_point| {
                deps.insert(range_point.starts.transactional_id());
                result |= range_point.starts.snapshot().as_ref();
            });
        }

        (result, deps)
    }

    /// Every record id present in the index.
    #[must_use]
    pub fn all_records(&self) -> RoaringBitmap {
        let mut all = RoaringBitmap::new();
        self.points.for_each_visible(|_, range_point| {
            all |= range_point.starts.snapshot().as_ref();
        });

        all
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Threshold-ordered (threshold, starts, ends) triples for the
    /// persistence collaborator.
    #[must_use]
    pub fn snapshot_points(&self) -> Vec<(i64, RoaringBitmap, RoaringBitmap)> {
        let mut out = Vec::new();
        self.points.for_each_visible(|threshold, range_point| {
            out.push((
                *threshold,
                (*range_point.starts.snapshot()).clone(),
                (*range_point.ends.snapshot()).clone(),
            ));
        });

        out
    }

    // --- Transaction plumbing ---

    pub fn apply_committed(&mut self, committed: &mut CommittedLayers) {
        // drain point layers before the map applies its removals, so a
        // point emptied and dropped inside the transaction does not leave
        // its layers behind
        if !committed.is_empty() {
            for threshold in self.points.visible_keys() {
                self.points.with_value_mut(&threshold, |point| {
                    point.starts.apply_committed(committed);
                    point.ends.apply_committed(committed);
                });
            }
        }

        self.points.apply_committed(committed);

        // points first inserted inside the transaction enter the base only
        // with the map layer above
        if !committed.is_empty() {
            for threshold in self.points.visible_keys() {
                self.points.with_value_mut(&threshold, |point| {
                    point.starts.apply_committed(committed);
                    point.ends.apply_committed(committed);
                });
            }
        }
    }

    fn point_insert(&mut self, threshold: i64, record_id: RecordId, start: bool) {
        if !self.points.contains_key(&threshold) {
            self.points.insert(threshold, RangePoint::default());
        }

        self.points.with_value_mut(&threshold, |point| {
            if start {
                point.starts.insert(record_id);
            } else {
                point.ends.insert(record_id);
            }
        });
    }

    fn point_remove(&mut self, threshold: i64, record_id: RecordId, start: bool) {
        let now_empty = self
            .points
            .with_value_mut(&threshold, |point| {
                if start {
                    point.starts.remove(record_id);
                } else {
                    point.ends.remove(record_id);
                }

                point.starts.is_empty() && point.ends.is_empty()
            })
            .unwrap_or(false);

        if now_empty {
            self.points.remove(&threshold);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(from: i64, to: i64) -> NumberRange {
        NumberRange::new(from, to).unwrap()
    }

    fn ids(bitmap: &RoaringBitmap) -> Vec<u32> {
        bitmap.iter().collect()
    }

    #[test]
    fn valid_in_is_inclusive_at_both_ends() {
        let mut ix = RangeIndex::new();
        ix.add_record(1, &[range(2, 6)]);

        assert_eq!(ids(&ix.valid_in(1).0), Vec::<u32>::new());
        assert_eq!(ids(&ix.valid_in(2).0), vec![1]);
        assert_eq!(ids(&ix.valid_in(4).0), vec![1]);
        assert_eq!(ids(&ix.valid_in(6).0), vec![1]);
        assert_eq!(ids(&ix.valid_in(7).0), Vec::<u32>::new());
    }

    #[test]
    fn disjoint_ranges_of_one_record_reopen_correctly() {
        let mut ix = RangeIndex::new();
        ix.add_record(1, &[range(1, 2), range(5, 6)]);

        assert_eq!(ids(&ix.valid_in(2).0), vec![1]);
        assert_eq!(ids(&ix.valid_in(3).0), Vec::<u32>::new());
        assert_eq!(ids(&ix.valid_in(5).0), vec![1]);
    }

    #[test]
    fn single_point_range_is_valid_only_at_its_point() {
        let mut ix = RangeIndex::new();
        ix.add_record(3, &[range(4, 4)]);

        assert_eq!(ids(&ix.valid_in(4).0), vec![3]);
        assert_eq!(ids(&ix.valid_in(5).0), Vec::<u32>::new());
    }

    #[test]
    fn overlapping_requires_a_shared_point() {
        let mut ix = RangeIndex::new();
        ix.add_record(1, &[range(2, 4)]);
        ix.add_record(2, &[range(6, 8)]);

        assert_eq!(ids(&ix.overlapping(4, 6).0), vec![1, 2]);
        assert_eq!(ids(&ix.overlapping(5, 5).0), Vec::<u32>::new());
        assert_eq!(ids(&ix.overlapping(0, 1).0), Vec::<u32>::new());
        assert_eq!(ids(&ix.overlapping(8, 9).0), vec![2]);
    }

    #[test]
    fn remove_validates_before_mutating() {
        let mut ix = RangeIndex::new();
        ix.add_record(1, &[range(2, 4)]);

        let err = ix.remove_record(1, &[range(2, 5)]).unwrap_err();
        assert!(matches!(err, RangeIndexError::RangeNotRegistered { record_id: 1, .. }));
        assert_eq!(ids(&ix.valid_in(3).0), vec![1]);

        ix.remove_record(1, &[range(2, 4)]).unwrap();
        assert!(ix.is_empty());
    }
}
