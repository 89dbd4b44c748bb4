use crate::formula::Formula;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, sync::Arc};
use tessera_tx::TransactionalId;

///
/// FlattenedFormula
///
/// A formula's materialized bitmap plus the cache identity it was
/// computed under, detached from the original tree. A cache or
/// serialization collaborator can persist this and later rehydrate a
/// formula that computes the identical bitmap and reports the same
/// structural hash and dependency-id set for validity checks.
///

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FlattenedFormula {
    bitmap: RoaringBitmap,
    dependency_ids: Vec<u64>,
    structural_hash: u64,
}

impl FlattenedFormula {
    #[must_use]
    pub fn flatten(formula: &Formula) -> Self {
        Self {
            bitmap: (*formula.compute()).clone(),
            dependency_ids: formula
                .dependency_ids()
                .iter()
                .map(|id| id.as_u64())
                .collect(),
            structural_hash: formula.structural_hash(),
        }
    }

    #[must_use]
    pub const fn structural_hash(&self) -> u64 {
        self.structural_hash
    }

    pub fn dependency_ids(&self) -> impl Iterator<Item = TransactionalId> + '_ {
        self.dependency_ids
            .iter()
            .map(|raw| TransactionalId::from_raw(*raw))
    }

    #[must_use]
    pub fn into_formula(self) -> Formula {
        let deps: BTreeSet<TransactionalId> = self
            .dependency_ids
            .iter()
            .map(|raw| TransactionalId::from_raw(*raw))
            .collect();

        Formula::rehydrated(Arc::new(self.bitmap), deps, self.structural_hash)
    }
}
