use crate::{
    id::TransactionalId,
    producer::TransactionalProducer,
    registry,
};
use std::sync::Arc;

///
/// TransactionalVec
///
/// Growable positional array. The transactional layer is an operation log
/// (insert-at / remove-at, positions in visible coordinates at the time
/// of the operation) replayed over the base on demand; the replayed
/// snapshot is memoized inside the layer and is always safe to drop.
/// The base is shared as `Arc`, so an untransacted snapshot is O(1).
///

#[derive(Debug)]
pub struct TransactionalVec<T> {
    id: TransactionalId,
    base: Arc<Vec<T>>,
}

#[derive(Clone, Debug)]
pub enum VecOp<T> {
    InsertAt(usize, T),
    RemoveAt(usize),
}

///
/// VecChanges
///

#[derive(Debug)]
pub struct VecChanges<T> {
    ops: Vec<VecOp<T>>,
    merged: Option<Arc<Vec<T>>>,
}

impl<T> Default for VecChanges<T> {
    fn default() -> Self {
        Self {
            ops: Vec::new(),
            merged: None,
        }
    }
}

impl<T: Clone> VecChanges<T> {
    fn replay(&mut self, base: &Arc<Vec<T>>) -> Arc<Vec<T>> {
        if let Some(merged) = &self.merged {
            return Arc::clone(merged);
        }

        let mut out: Vec<T> = base.as_ref().clone();
        for op in &self.ops {
            match op {
                VecOp::InsertAt(position, item) => out.insert(*position, item.clone()),
                VecOp::RemoveAt(position) => {
                    out.remove(*position);
                }
            }
        }

        let merged = Arc::new(out);
        self.merged = Some(Arc::clone(&merged));

        merged
    }
}

impl<T> TransactionalVec<T>
where
    T: Clone + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: TransactionalId::next(),
            base: Arc::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn from_vec(items: Vec<T>) -> Self {
        Self {
            id: TransactionalId::next(),
            base: Arc::new(items),
        }
    }

    // --- Mutation ---

    /// Insert `item` at `position` in the visible array.
    ///
    /// Panics when `position` exceeds the visible length, like
    /// `Vec::insert`; a buffered op is bounds-checked at the call site,
    /// not at replay time.
    pub fn insert_at(&mut self, position: usize, item: T) {
        if registry::transaction_open() {
            let len = self.len();
            assert!(
                position <= len,
                "insertion index (is {position}) should be <= len (is {len})"
            );
            let _ = registry::with_layer_mut::<VecChanges<T>, _>(self.id, move |layer| {
                layer.ops.push(VecOp::InsertAt(position, item));
                layer.merged = None;
            });
        } else {
            Arc::make_mut(&mut self.base).insert(position, item);
        }
    }

    /// Remove and return the element at `position` in the visible array.
    pub fn remove_at(&mut self, position: usize) -> Option<T> {
        if registry::transaction_open() {
            let removed = self.get(position)?;
            let _ = registry::with_layer_mut::<VecChanges<T>, _>(self.id, |layer| {
                layer.ops.push(VecOp::RemoveAt(position));
                layer.merged = None;
            });

            Some(removed)
        } else {
            if position >= self.base.len() {
                return None;
            }

            Some(Arc::make_mut(&mut self.base).remove(position))
        }
    }

    // --- Reads ---

    #[must_use]
    pub fn get(&self, position: usize) -> Option<T> {
        registry::with_layer::<VecChanges<T>, _>(self.id, |layer| {
            layer.replay(&self.base).get(position).cloned()
        })
        .unwrap_or_else(|| self.base.get(position).cloned())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        registry::with_layer::<VecChanges<T>, _>(self.id, |layer| layer.replay(&self.base).len())
            .unwrap_or_else(|| self.base.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The visible array as a shared snapshot; O(1) when no layer exists.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<T>> {
        registry::with_layer::<VecChanges<T>, _>(self.id, |layer| layer.replay(&self.base))
            .unwrap_or_else(|| Arc::clone(&self.base))
    }
}

impl<T> Default for TransactionalVec<T>
where
    T: Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TransactionalProducer for TransactionalVec<T>
where
    T: Clone + 'static,
{
    type Layer = VecChanges<T>;

    fn apply_layer(&mut self, mut layer: Self::Layer) {
        self.base = layer.replay(&self.base);
        self.id = TransactionalId::next();
    }

    fn transactional_id(&self) -> TransactionalId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{begin_transaction, commit, open_layer_count, rollback};
    use proptest::prelude::*;

    #[test]
    fn rollback_restores_exact_previous_content() {
        let mut array = TransactionalVec::from_vec(vec![1, 5, 10]);

        begin_transaction().unwrap();
        array.insert_at(3, 11);
        array.insert_at(0, 0);
        array.insert_at(3, 6);
        assert_eq!(array.snapshot().as_ref(), &vec![0, 1, 5, 6, 10, 11]);
        rollback().unwrap();

        assert_eq!(array.snapshot().as_ref(), &vec![1, 5, 10]);
        assert_eq!(open_layer_count(), 0);
    }

    #[test]
    fn commit_applies_positional_ops_in_order() {
        let mut array = TransactionalVec::from_vec(vec![1, 5, 10]);

        begin_transaction().unwrap();
        array.insert_at(1, 3);
        let removed = array.remove_at(3);
        assert_eq!(removed, Some(5));
        let mut committed = commit().unwrap();
        array.apply_committed(&mut committed);

        assert_eq!(array.snapshot().as_ref(), &vec![1, 3, 10]);
    }

    #[test]
    fn snapshot_is_shared_outside_a_transaction() {
        let array = TransactionalVec::from_vec(vec![7, 8]);
        let a = array.snapshot();
        let b = array.snapshot();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn remove_at_out_of_bounds_is_none() {
        let mut array = TransactionalVec::from_vec(vec![1]);
        assert_eq!(array.remove_at(5), None);

        begin_transaction().unwrap();
        assert_eq!(array.remove_at(5), None);
        rollback().unwrap();
    }

    #[test]
    #[should_panic(expected = "insertion index")]
    fn buffered_insert_out_of_bounds_panics_at_the_call_site() {
        let mut array = TransactionalVec::from_vec(vec![1]);

        begin_transaction().unwrap();
        array.insert_at(0, 0);
        array.insert_at(5, 9);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Insert(usize, i32),
        Remove(usize),
    }

    proptest! {
        #[test]
        fn commit_matches_reference_model(
            seed in proptest::collection::vec(any::<i32>(), 0..12),
            raw_ops in proptest::collection::vec((any::<bool>(), any::<usize>(), any::<i32>()), 0..24),
        ) {
            let mut array = TransactionalVec::from_vec(seed.clone());
            let mut model = seed;

            begin_transaction().unwrap();
            for (is_insert, position, item) in raw_ops {
                let op = if is_insert {
                    Op::Insert(position % (model.len() + 1), item)
                } else if model.is_empty() {
                    continue;
                } else {
                    Op::Remove(position % model.len())
                };
                match op {
                    Op::Insert(at, item) => {
                        array.insert_at(at, item);
                        model.insert(at, item);
                    }
                    Op::Remove(at) => {
                        array.remove_at(at);
                        model.remove(at);
                    }
                }
            }
            let mut committed = commit().unwrap();
            array.apply_committed(&mut committed);

            let snapshot = array.snapshot();
            prop_assert_eq!(snapshot.as_ref(), &model);
        }

        #[test]
        fn rollback_is_identity(
            seed in proptest::collection::vec(any::<i32>(), 0..12),
            raw_ops in proptest::collection::vec((any::<bool>(), any::<usize>(), any::<i32>()), 0..24),
        ) {
            let mut array = TransactionalVec::from_vec(seed.clone());

            begin_transaction().unwrap();
            let mut visible_len = seed.len();
            for (is_insert, position, item) in raw_ops {
                if is_insert {
                    array.insert_at(position % (visible_len + 1), item);
                    visible_len += 1;
                } else if visible_len > 0 {
                    array.remove_at(position % visible_len);
                    visible_len -= 1;
                }
            }
            rollback().unwrap();

            let snapshot = array.snapshot();
            prop_assert_eq!(snapshot.as_ref(), &seed);
            prop_assert_eq!(open_layer_count(), 0);
        }
    }
}
