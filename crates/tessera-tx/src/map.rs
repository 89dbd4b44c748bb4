use crate::{
    id::TransactionalId,
    producer::TransactionalProducer,
    registry,
};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    ops::RangeBounds,
};

///
/// TransactionalMap
///
/// Ordered map whose transactional layer is a diff log of upserts and
/// removals, never a copy of the base. Values may themselves be
/// transactional containers; `with_value_mut` reaches them wherever they
/// currently live (base or layer) so their own mutations route into their
/// own layers.
///

#[derive(Debug)]
pub struct TransactionalMap<K, V> {
    id: TransactionalId,
    base: BTreeMap<K, V>,
}

///
/// MapChanges
///
/// One transaction's pending diff against a `TransactionalMap`.
/// Invariants: `removals` only names keys present in the base;
/// `upserts` and `removals` are disjoint.
///

#[derive(Debug)]
pub struct MapChanges<K, V> {
    upserts: BTreeMap<K, V>,
    removals: BTreeSet<K>,
}

impl<K, V> Default for MapChanges<K, V> {
    fn default() -> Self {
        Self {
            upserts: BTreeMap::new(),
            removals: BTreeSet::new(),
        }
    }
}

enum ValueLocation {
    Layer,
    Removed,
    Base,
}

impl<K, V> TransactionalMap<K, V>
where
    K: Ord + Clone + 'static,
    V: 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: TransactionalId::next(),
            base: BTreeMap::new(),
        }
    }

    // --- Mutation ---

    /// Insert or overwrite `key`, buffering into the thread's layer when a
    /// transaction is open.
    pub fn insert(&mut self, key: K, value: V) {
        if registry::transaction_open() {
            let _ = registry::with_layer_mut::<MapChanges<K, V>, _>(self.id, move |layer| {
                layer.removals.remove(&key);
                layer.upserts.insert(key, value);
            });
        } else {
            self.base.insert(key, value);
        }
    }

    /// Remove `key`; reports whether it was visibly present.
    pub fn remove(&mut self, key: &K) -> bool {
        if registry::transaction_open() {
            if !self.contains_key(key) {
                return false;
            }

            let in_base = self.base.contains_key(key);
            let _ = registry::with_layer_mut::<MapChanges<K, V>, _>(self.id, |layer| {
                layer.upserts.remove(key);
                if in_base {
                    layer.removals.insert(key.clone());
                }
            });

            true
        } else {
            self.base.remove(key).is_some()
        }
    }

    // --- Reads (base ∘ layer for the transaction's own thread) ---

    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        registry::with_layer::<MapChanges<K, V>, _>(self.id, |layer| {
            if layer.upserts.contains_key(key) {
                true
            } else if layer.removals.contains(key) {
                false
            } else {
                self.base.contains_key(key)
            }
        })
        .unwrap_or_else(|| self.base.contains_key(key))
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        match self.locate(key) {
            ValueLocation::Removed => None,
            ValueLocation::Base => self.base.get(key).cloned(),
            ValueLocation::Layer => registry::with_layer::<MapChanges<K, V>, _>(self.id, |layer| {
                layer.upserts.get(key).cloned()
            })
            .flatten(),
        }
    }

    /// Borrow the visible value under `key` for reading.
    pub fn with_value<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        match self.locate(key) {
            ValueLocation::Removed => None,
            ValueLocation::Base => self.base.get(key).map(f),
            ValueLocation::Layer => registry::with_layer::<MapChanges<K, V>, _>(self.id, |layer| {
                layer.upserts.get(key).map(f)
            })
            .flatten(),
        }
    }

    /// Borrow the visible value under `key` for mutation, wherever it
    /// currently lives. Nested transactional values buffer their own
    /// mutations into their own layers.
    pub fn with_value_mut<R>(&mut self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        match self.locate(key) {
            ValueLocation::Removed => None,
            ValueLocation::Base => self.base.get_mut(key).map(f),
            ValueLocation::Layer => registry::with_layer::<MapChanges<K, V>, _>(self.id, |layer| {
                layer.upserts.get_mut(key).map(f)
            })
            .flatten(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        registry::with_layer::<MapChanges<K, V>, _>(self.id, |layer| {
            let added = layer
                .upserts
                .keys()
                .filter(|key| !self.base.contains_key(key))
                .count();

            self.base.len() - layer.removals.len() + added
        })
        .unwrap_or_else(|| self.base.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every visible entry in ascending key order.
    pub fn for_each_visible(&self, f: impl FnMut(&K, &V)) {
        self.for_each_in(.., f);
    }

    /// Visit visible entries whose keys fall within `range`, in ascending
    /// key order.
    pub fn for_each_in<R>(&self, range: R, mut f: impl FnMut(&K, &V))
    where
        R: RangeBounds<K>,
    {
        let bounds = (range.start_bound(), range.end_bound());
        let merged = registry::with_layer::<MapChanges<K, V>, _>(self.id, |layer| {
            let mut base_iter = self.base.range(bounds).peekable();
            let mut upsert_iter = layer.upserts.range(bounds).peekable();
            loop {
                match (base_iter.peek(), upsert_iter.peek()) {
                    (Some((base_key, base_value)), Some((upsert_key, upsert_value))) => {
                        match base_key.cmp(upsert_key) {
                            Ordering::Less => {
                                if !layer.removals.contains(base_key) {
                                    f(base_key, base_value);
                                }
                                base_iter.next();
                            }
                            Ordering::Greater => {
                                f(upsert_key, upsert_value);
                                upsert_iter.next();
                            }
                            Ordering::Equal => {
                                f(upsert_key, upsert_value);
                                base_iter.next();
                                upsert_iter.next();
                            }
                        }
                    }
                    (Some((base_key, base_value)), None) => {
                        if !layer.removals.contains(base_key) {
                            f(base_key, base_value);
                        }
                        base_iter.next();
                    }
                    (None, Some((upsert_key, upsert_value))) => {
                        f(upsert_key, upsert_value);
                        upsert_iter.next();
                    }
                    (None, None) => break,
                }
            }
        });

        if merged.is_none() {
            for (key, value) in self.base.range(bounds) {
                f(key, value);
            }
        }
    }

    /// Visible keys in ascending order.
    #[must_use]
    pub fn visible_keys(&self) -> Vec<K> {
        let mut keys = Vec::new();
        self.for_each_visible(|key, _| keys.push(key.clone()));

        keys
    }

    fn locate(&self, key: &K) -> ValueLocation {
        registry::with_layer::<MapChanges<K, V>, _>(self.id, |layer| {
            if layer.upserts.contains_key(key) {
                ValueLocation::Layer
            } else if layer.removals.contains(key) {
                ValueLocation::Removed
            } else {
                ValueLocation::Base
            }
        })
        .unwrap_or(ValueLocation::Base)
    }
}

impl<K, V> Default for TransactionalMap<K, V>
where
    K: Ord + Clone + 'static,
    V: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TransactionalProducer for TransactionalMap<K, V>
where
    K: Ord + Clone + 'static,
    V: 'static,
{
    type Layer = MapChanges<K, V>;

    fn transactional_id(&self) -> TransactionalId {
        self.id
    }

    fn apply_layer(&mut self, layer: Self::Layer) {
        for key in layer.removals {
            self.base.remove(&key);
        }
        for (key, value) in layer.upserts {
            self.base.insert(key, value);
        }

        self.id = TransactionalId::next();
    }
}
