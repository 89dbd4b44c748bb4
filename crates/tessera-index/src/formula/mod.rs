//! Lazily evaluated bitmap set algebra.
//!
//! A formula is an immutable DAG node: AND/OR/NOT/JOIN over record-id
//! bitmaps, constant and empty leaves, and index-backed bucket leaves.
//! Each node precomputes, bottom-up at construction time, a structural
//! xxh3 hash and the set of transactional producer identities it reads
//! from; the pair is the cache key external collaborators use to decide
//! whether a previously computed result is still backed by the same
//! committed index state. `compute` is side-effect-free and memoizes its
//! result for the node's lifetime.

mod flatten;

pub use flatten::FlattenedFormula;

use crate::RecordId;
use roaring::RoaringBitmap;
use std::{
    collections::BTreeSet,
    sync::{Arc, OnceLock},
};
use tessera_tx::TransactionalId;
use xxhash_rust::xxh3::Xxh3;

const TAG_EMPTY: u8 = 1;
const TAG_CONSTANT: u8 = 2;
const TAG_BITMAPS: u8 = 3;
const TAG_AND: u8 = 4;
const TAG_OR: u8 = 5;
const TAG_NOT: u8 = 6;
const TAG_JOIN: u8 = 7;

///
/// Formula
///
/// Cheap to clone; clones share the node and its memoized result.
///

#[derive(Clone)]
pub struct Formula {
    node: Arc<FormulaNode>,
}

struct FormulaNode {
    kind: FormulaKind,
    hash: u64,
    deps: BTreeSet<TransactionalId>,
    memo: OnceLock<Arc<RoaringBitmap>>,
}

enum FormulaKind {
    Empty,
    Constant {
        bitmap: Arc<RoaringBitmap>,
    },
    /// Index-backed leaf: the lazy union of bucket snapshots, identified
    /// by the producer ids recorded in the node's dependency set.
    Bitmaps {
        sources: Vec<Arc<RoaringBitmap>>,
    },
    And {
        children: Vec<Formula>,
    },
    Or {
        children: Vec<Formula>,
    },
    Not {
        subtracted: Formula,
        universe: Formula,
    },
    Join {
        children: Vec<Formula>,
    },
}

fn deps_of(children: &[Formula]) -> BTreeSet<TransactionalId> {
    let mut deps = BTreeSet::new();
    for child in children {
        deps.extend(child.node.deps.iter().copied());
    }

    deps
}

fn hash_children(tag: u8, children: &[Formula]) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(&[tag]);
    for child in children {
        hasher.update(&child.node.hash.to_le_bytes());
    }

    hasher.digest()
}

impl Formula {
    fn from_parts(kind: FormulaKind, hash: u64, deps: BTreeSet<TransactionalId>) -> Self {
        Self {
            node: Arc::new(FormulaNode {
                kind,
                hash,
                deps,
                memo: OnceLock::new(),
            }),
        }
    }

    // --- Leaves ---

    #[must_use]
    pub fn empty() -> Self {
        Self::empty_with_dependencies([])
    }

    /// Empty result that still names the producers whose change would
    /// make it non-empty (e.g. the histogram a missing bucket would be
    /// created in).
    #[must_use]
    pub fn empty_with_dependencies(deps: impl IntoIterator<Item = TransactionalId>) -> Self {
        let deps: BTreeSet<TransactionalId> = deps.into_iter().collect();
        let mut hasher = Xxh3::new();
        hasher.update(&[TAG_EMPTY]);
        for dep in &deps {
            hasher.update(&dep.as_u64().to_le_bytes());
        }

        Self::from_parts(FormulaKind::Empty, hasher.digest(), deps)
    }

    /// Wrap a precomputed bitmap. The hash covers the bitmap contents, so
    /// equal constants hash equally regardless of provenance.
    #[must_use]
    pub fn constant(
        bitmap: Arc<RoaringBitmap>,
        deps: impl IntoIterator<Item = TransactionalId>,
    ) -> Self {
        let deps: BTreeSet<TransactionalId> = deps.into_iter().collect();
        let mut hasher = Xxh3::new();
        hasher.update(&[TAG_CONSTANT]);
        for record in bitmap.iter() {
            hasher.update(&record.to_le_bytes());
        }
        for dep in &deps {
            hasher.update(&dep.as_u64().to_le_bytes());
        }
        let hash = hasher.digest();

        Self::from_parts(FormulaKind::Constant { bitmap }, hash, deps)
    }

    /// Rehydrate a flattened result so it reports the hash and dependency
    /// ids of the formula it was computed from.
    pub(crate) fn rehydrated(
        bitmap: Arc<RoaringBitmap>,
        deps: BTreeSet<TransactionalId>,
        hash: u64,
    ) -> Self {
        Self::from_parts(FormulaKind::Constant { bitmap }, hash, deps)
    }

    /// Index-backed leaf over bucket snapshots. The hash is derived from
    /// the bucket producer identities, not the bucket contents, which
    /// keeps formula construction O(buckets) regardless of bucket size.
    #[must_use]
    pub fn bitmaps(
        sources: Vec<Arc<RoaringBitmap>>,
        deps: impl IntoIterator<Item = TransactionalId>,
    ) -> Self {
        let deps: BTreeSet<TransactionalId> = deps.into_iter().collect();
        let mut hasher = Xxh3::new();
        hasher.update(&[TAG_BITMAPS]);
        for dep in &deps {
            hasher.update(&dep.as_u64().to_le_bytes());
        }
        let hash = hasher.digest();

        Self::from_parts(FormulaKind::Bitmaps { sources }, hash, deps)
    }

    // --- Combinators ---

    #[must_use]
    pub fn and(children: Vec<Self>) -> Self {
        let hash = hash_children(TAG_AND, &children);
        let deps = deps_of(&children);

        Self::from_parts(FormulaKind::And { children }, hash, deps)
    }

    #[must_use]
    pub fn or(children: Vec<Self>) -> Self {
        let hash = hash_children(TAG_OR, &children);
        let deps = deps_of(&children);

        Self::from_parts(FormulaKind::Or { children }, hash, deps)
    }

    /// `universe \ subtracted`. The universe must be supplied explicitly;
    /// record ids are otherwise unbounded.
    #[must_use]
    pub fn not(subtracted: Self, universe: Self) -> Self {
        let pair = [subtracted, universe];
        let hash = hash_children(TAG_NOT, &pair);
        let deps = deps_of(&pair);
        let [subtracted, universe] = pair;

        Self::from_parts(FormulaKind::Not { subtracted, universe }, hash, deps)
    }

    /// Union that keeps per-child provenance reachable through
    /// [`Formula::contributions`].
    #[must_use]
    pub fn join(children: Vec<Self>) -> Self {
        let hash = hash_children(TAG_JOIN, &children);
        let deps = deps_of(&children);

        Self::from_parts(FormulaKind::Join { children }, hash, deps)
    }

    // --- Evaluation ---

    /// Materialize the record-id set. Idempotent; the first call within
    /// the node's lifetime computes, later calls return the memoized
    /// result.
    #[must_use]
    pub fn compute(&self) -> Arc<RoaringBitmap> {
        Arc::clone(self.node.memo.get_or_init(|| self.evaluate()))
    }

    fn evaluate(&self) -> Arc<RoaringBitmap> {
        match &self.node.kind {
            FormulaKind::Empty => Arc::new(RoaringBitmap::new()),
            FormulaKind::Constant { bitmap } => Arc::clone(bitmap),
            FormulaKind::Bitmaps { sources } => {
                let mut out = RoaringBitmap::new();
                for source in sources {
                    out |= source.as_ref();
                }

                Arc::new(out)
            }
            FormulaKind::And { children } => {
                let mut iter = children.iter();
                let Some(first) = iter.next() else {
                    return Arc::new(RoaringBitmap::new());
                };

                let mut out = (*first.compute()).clone();
                for child in iter {
                    if out.is_empty() {
                        break;
                    }
                    out &= child.compute().as_ref();
                }

                Arc::new(out)
            }
            FormulaKind::Or { children } | FormulaKind::Join { children } => {
                let mut out = RoaringBitmap::new();
                for child in children {
                    out |= child.compute().as_ref();
                }

                Arc::new(out)
            }
            FormulaKind::Not { subtracted, universe } => {
                let mut out = (*universe.compute()).clone();
                out -= subtracted.compute().as_ref();

                Arc::new(out)
            }
        }
    }

    /// For JOIN nodes, the computed bitmap of every child in order, so a
    /// downstream consumer can tell which sub-formula contributed which
    /// record ids. `None` for every other node kind.
    #[must_use]
    pub fn contributions(&self) -> Option<Vec<(Self, Arc<RoaringBitmap>)>> {
        match &self.node.kind {
            FormulaKind::Join { children } => Some(
                children
                    .iter()
                    .map(|child| (child.clone(), child.compute()))
                    .collect(),
            ),
            _ => None,
        }
    }

    // --- Cache identity ---

    /// Structural hash, stable across equal trees.
    #[must_use]
    pub fn structural_hash(&self) -> u64 {
        self.node.hash
    }

    /// Identities of every transactional producer this formula
    /// transitively reads from. A cached result stays valid only while
    /// all of them still back the live indexes.
    #[must_use]
    pub fn dependency_ids(&self) -> &BTreeSet<TransactionalId> {
        &self.node.deps
    }

    #[must_use]
    pub fn depends_on(&self, id: TransactionalId) -> bool {
        self.node.deps.contains(&id)
    }

    /// Convenience for tests and small consumers.
    #[must_use]
    pub fn compute_to_vec(&self) -> Vec<RecordId> {
        self.compute().iter().collect()
    }
}

impl std::fmt::Debug for Formula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.node.kind {
            FormulaKind::Empty => "Empty",
            FormulaKind::Constant { .. } => "Constant",
            FormulaKind::Bitmaps { .. } => "Bitmaps",
            FormulaKind::And { .. } => "And",
            FormulaKind::Or { .. } => "Or",
            FormulaKind::Not { .. } => "Not",
            FormulaKind::Join { .. } => "Join",
        };

        f.debug_struct("Formula")
            .field("kind", &kind)
            .field("hash", &self.node.hash)
            .field("deps", &self.node.deps.len())
            .finish()
    }
}
