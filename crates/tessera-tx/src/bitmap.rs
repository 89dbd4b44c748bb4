use crate::{
    id::TransactionalId,
    producer::TransactionalProducer,
    registry,
};
use roaring::RoaringBitmap;
use std::sync::Arc;

///
/// TransactionalBitmap
///
/// Record-id set over a shared roaring bitmap. The layer keeps two small
/// bitmaps of additions and removals; the visible set is
/// `(base − removed) ∪ added`. Invariants kept by the mutation ops:
/// `removed ⊆ base` and `added ∩ base = ∅`, so the visible cardinality is
/// computable without materializing.
///

#[derive(Debug)]
pub struct TransactionalBitmap {
    id: TransactionalId,
    base: Arc<RoaringBitmap>,
}

///
/// BitmapChanges
///

#[derive(Debug, Default)]
pub struct BitmapChanges {
    added: RoaringBitmap,
    removed: RoaringBitmap,
    merged: Option<Arc<RoaringBitmap>>,
}

impl BitmapChanges {
    fn materialize(&mut self, base: &Arc<RoaringBitmap>) -> Arc<RoaringBitmap> {
        if let Some(merged) = &self.merged {
            return Arc::clone(merged);
        }

        let mut out = base.as_ref().clone();
        out -= &self.removed;
        out |= &self.added;
        let merged = Arc::new(out);
        self.merged = Some(Arc::clone(&merged));

        merged
    }
}

impl TransactionalBitmap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: TransactionalId::next(),
            base: Arc::new(RoaringBitmap::new()),
        }
    }

    #[must_use]
    pub fn from_bitmap(bitmap: RoaringBitmap) -> Self {
        Self {
            id: TransactionalId::next(),
            base: Arc::new(bitmap),
        }
    }

    // --- Mutation ---

    /// Add a record id; reports whether it was newly added.
    pub fn insert(&mut self, record_id: u32) -> bool {
        if registry::transaction_open() {
            if self.contains(record_id) {
                return false;
            }

            let in_base = self.base.contains(record_id);
            let _ = registry::with_layer_mut::<BitmapChanges, _>(self.id, |layer| {
                if in_base {
                    layer.removed.remove(record_id);
                } else {
                    layer.added.insert(record_id);
                }
                layer.merged = None;
            });

            true
        } else {
            Arc::make_mut(&mut self.base).insert(record_id)
        }
    }

    /// Remove a record id; reports whether it was visibly present.
    pub fn remove(&mut self, record_id: u32) -> bool {
        if registry::transaction_open() {
            if !self.contains(record_id) {
                return false;
            }

            let in_base = self.base.contains(record_id);
            let _ = registry::with_layer_mut::<BitmapChanges, _>(self.id, |layer| {
                if in_base {
                    layer.removed.insert(record_id);
                } else {
                    layer.added.remove(record_id);
                }
                layer.merged = None;
            });

            true
        } else {
            Arc::make_mut(&mut self.base).remove(record_id)
        }
    }

    // --- Reads ---

    #[must_use]
    pub fn contains(&self, record_id: u32) -> bool {
        registry::with_layer::<BitmapChanges, _>(self.id, |layer| {
            layer.added.contains(record_id)
                || (self.base.contains(record_id) && !layer.removed.contains(record_id))
        })
        .unwrap_or_else(|| self.base.contains(record_id))
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        registry::with_layer::<BitmapChanges, _>(self.id, |layer| {
            self.base.len() - layer.removed.len() + layer.added.len()
        })
        .unwrap_or_else(|| self.base.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The visible set as a shared snapshot; O(1) when no layer exists.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RoaringBitmap> {
        registry::with_layer::<BitmapChanges, _>(self.id, |layer| layer.materialize(&self.base))
            .unwrap_or_else(|| Arc::clone(&self.base))
    }
}

impl Default for TransactionalBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionalProducer for TransactionalBitmap {
    type Layer = BitmapChanges;

    fn transactional_id(&self) -> TransactionalId {
        self.id
    }

    fn apply_layer(&mut self, layer: Self::Layer) {
        let base = Arc::make_mut(&mut self.base);
        *base -= &layer.removed;
        *base |= &layer.added;
        self.id = TransactionalId::next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{begin_transaction, commit, rollback};
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[test]
    fn layered_insert_and_remove_are_invisible_until_commit() {
        let mut bitmap = TransactionalBitmap::new();
        bitmap.insert(1);
        bitmap.insert(5);

        begin_transaction().unwrap();
        assert!(bitmap.insert(9));
        assert!(!bitmap.insert(9));
        assert!(bitmap.remove(1));
        assert!(bitmap.contains(9));
        assert!(!bitmap.contains(1));
        assert_eq!(bitmap.len(), 2);

        // base untouched while the layer is open
        assert!(bitmap.base.contains(1));
        assert!(!bitmap.base.contains(9));
        rollback().unwrap();

        assert!(bitmap.contains(1));
        assert!(!bitmap.contains(9));
    }

    #[test]
    fn commit_merges_diff_into_fresh_base() {
        let mut bitmap = TransactionalBitmap::new();
        bitmap.insert(1);
        let id_before = bitmap.transactional_id();

        begin_transaction().unwrap();
        bitmap.insert(2);
        bitmap.remove(1);
        let mut committed = commit().unwrap();
        bitmap.apply_committed(&mut committed);

        assert_eq!(bitmap.snapshot().iter().collect::<Vec<_>>(), vec![2]);
        assert_ne!(bitmap.transactional_id(), id_before);
    }

    #[test]
    fn reinserting_a_base_record_removed_in_layer_restores_it() {
        let mut bitmap = TransactionalBitmap::new();
        bitmap.insert(4);

        begin_transaction().unwrap();
        assert!(bitmap.remove(4));
        assert!(bitmap.insert(4));
        assert!(bitmap.contains(4));
        let mut committed = commit().unwrap();
        bitmap.apply_committed(&mut committed);

        assert!(bitmap.contains(4));
        assert_eq!(bitmap.len(), 1);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Insert(u32),
        Remove(u32),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..64).prop_map(Op::Insert),
            (0u32..64).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn commit_matches_reference_model(
            seed in proptest::collection::vec(0u32..64, 0..16),
            ops in proptest::collection::vec(op_strategy(), 0..32),
        ) {
            let mut bitmap = TransactionalBitmap::new();
            let mut model: BTreeSet<u32> = BTreeSet::new();
            for id in seed {
                bitmap.insert(id);
                model.insert(id);
            }

            begin_transaction().unwrap();
            for op in &ops {
                match op {
                    Op::Insert(id) => {
                        bitmap.insert(*id);
                        model.insert(*id);
                    }
                    Op::Remove(id) => {
                        bitmap.remove(*id);
                        model.remove(id);
                    }
                }
            }
            let mut committed = commit().unwrap();
            bitmap.apply_committed(&mut committed);

            prop_assert_eq!(bitmap.snapshot().iter().collect::<BTreeSet<_>>(), model.clone());
            prop_assert_eq!(bitmap.len(), model.len() as u64);
        }

        #[test]
        fn rollback_is_identity(
            seed in proptest::collection::vec(0u32..64, 0..16),
            ops in proptest::collection::vec(op_strategy(), 0..32),
        ) {
            let mut bitmap = TransactionalBitmap::new();
            let mut before: BTreeSet<u32> = BTreeSet::new();
            for id in seed {
                bitmap.insert(id);
                before.insert(id);
            }

            begin_transaction().unwrap();
            for op in &ops {
                match op {
                    Op::Insert(id) => {
                        bitmap.insert(*id);
                    }
                    Op::Remove(id) => {
                        bitmap.remove(*id);
                    }
                }
            }
            rollback().unwrap();

            prop_assert_eq!(bitmap.snapshot().iter().collect::<BTreeSet<_>>(), before.clone());
            prop_assert_eq!(bitmap.len(), before.len() as u64);
        }
    }
}
