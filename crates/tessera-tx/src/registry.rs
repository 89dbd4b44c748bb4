//! Thread-bound transaction scope and the producer-to-layer registry.
//!
//! Exactly one transaction may be bound to a thread at a time. Layers are
//! created lazily on a producer's first mutation inside the scope and are
//! consumed exactly once: `commit` moves them out wholesale for the owner
//! to apply, `rollback` drops them without touching any base state.
//!
//! Safety under two concurrent writer transactions against the same
//! producer is out of contract: the embedding scope must serialize
//! writers. Readers on threads with no bound transaction never touch this
//! registry's mutable state and observe only committed bases.

use crate::id::{TransactionalId, TxId};
use std::{
    any::Any,
    cell::RefCell,
    collections::HashMap,
    rc::Rc,
};
use thiserror::Error as ThisError;
use tracing::{debug, trace, warn};

///
/// TransactionError
///

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum TransactionError {
    #[error("a transaction is already bound to this thread")]
    TransactionAlreadyOpen,

    #[error("no transaction is bound to this thread")]
    NoTransactionOpen,
}

// Layers are type-erased; each producer knows its own layer type and
// downcasts on access. The per-layer RefCell keeps borrows independent,
// so a nested container may touch its own layer while its parent's layer
// is borrowed.
type LayerCell = Rc<RefCell<Box<dyn Any>>>;

struct TransactionScope {
    id: TxId,
    layers: HashMap<TransactionalId, LayerCell>,
}

thread_local! {
    static SCOPE: RefCell<Option<TransactionScope>> = const { RefCell::new(None) };
}

/// Bind a new transaction to the calling thread.
pub fn begin_transaction() -> Result<TxId, TransactionError> {
    SCOPE.with(|scope| {
        let mut scope = scope.borrow_mut();
        if scope.is_some() {
            return Err(TransactionError::TransactionAlreadyOpen);
        }

        let id = TxId::next();
        debug!(tx = id.as_u64(), "transaction begin");
        *scope = Some(TransactionScope {
            id,
            layers: HashMap::new(),
        });

        Ok(id)
    })
}

/// Identity of the transaction bound to the calling thread, if any.
#[must_use]
pub fn current_transaction() -> Option<TxId> {
    SCOPE.with(|scope| scope.borrow().as_ref().map(|s| s.id))
}

/// Whether the calling thread has an open transaction.
#[must_use]
pub fn transaction_open() -> bool {
    current_transaction().is_some()
}

/// Discard every layer created during the thread's transaction.
///
/// No producer base state is touched; cost is proportional to the number
/// of layers, not to any container's data volume.
pub fn rollback() -> Result<(), TransactionError> {
    SCOPE.with(|scope| {
        let taken = scope
            .borrow_mut()
            .take()
            .ok_or(TransactionError::NoTransactionOpen)?;
        debug!(
            tx = taken.id.as_u64(),
            layers = taken.layers.len(),
            "transaction rollback"
        );

        Ok(())
    })
}

/// Close the thread's transaction, handing every created layer back to
/// the structure owner for application.
pub fn commit() -> Result<CommittedLayers, TransactionError> {
    SCOPE.with(|scope| {
        let taken = scope
            .borrow_mut()
            .take()
            .ok_or(TransactionError::NoTransactionOpen)?;
        debug!(
            tx = taken.id.as_u64(),
            layers = taken.layers.len(),
            "transaction commit"
        );

        Ok(CommittedLayers {
            tx: taken.id,
            layers: taken.layers,
        })
    })
}

/// Number of layers currently held by the thread's open transaction.
#[must_use]
pub fn open_layer_count() -> usize {
    SCOPE.with(|scope| {
        scope
            .borrow()
            .as_ref()
            .map_or(0, |s| s.layers.len())
    })
}

fn layer_cell(id: TransactionalId) -> Option<LayerCell> {
    SCOPE.with(|scope| {
        scope
            .borrow()
            .as_ref()
            .and_then(|s| s.layers.get(&id).map(Rc::clone))
    })
}

fn layer_cell_or_create<L: 'static + Default>(id: TransactionalId) -> Option<LayerCell> {
    SCOPE.with(|scope| {
        let mut scope = scope.borrow_mut();
        let scope = scope.as_mut()?;
        let cell = scope.layers.entry(id).or_insert_with(|| {
            trace!(producer = id.as_u64(), "layer created");
            Rc::new(RefCell::new(Box::new(L::default()) as Box<dyn Any>))
        });

        Some(Rc::clone(cell))
    })
}

/// Run `f` against the producer's existing layer, if the calling thread
/// has one.
pub(crate) fn with_layer<L: 'static, R>(
    id: TransactionalId,
    f: impl FnOnce(&mut L) -> R,
) -> Option<R> {
    let cell = layer_cell(id)?;
    let mut layer = cell.borrow_mut();

    layer.as_mut().downcast_mut::<L>().map(f)
}

/// Run `f` against the producer's layer, creating it if this is the
/// producer's first mutation inside the transaction. Returns `None` when
/// no transaction is bound to the thread.
pub(crate) fn with_layer_mut<L: 'static + Default, R>(
    id: TransactionalId,
    f: impl FnOnce(&mut L) -> R,
) -> Option<R> {
    let cell = layer_cell_or_create::<L>(id)?;
    let mut layer = cell.borrow_mut();

    layer.as_mut().downcast_mut::<L>().map(f)
}

///
/// CommittedLayers
///
/// The set of layers a committed transaction created, keyed by producer
/// identity. The structure owner walks its tree and each changed producer
/// pops and applies its own layer; untouched producers are never copied.
/// A non-empty drop means some layer was never applied and its producer's
/// committed mutations were lost.
///

pub struct CommittedLayers {
    tx: TxId,
    layers: HashMap<TransactionalId, LayerCell>,
}

impl CommittedLayers {
    /// Remove and return the layer for one producer, if it mutated.
    #[must_use]
    pub fn take<L: 'static>(&mut self, id: TransactionalId) -> Option<L> {
        let cell = self.layers.remove(&id)?;
        match Rc::try_unwrap(cell) {
            Ok(layer) => match layer.into_inner().downcast::<L>() {
                Ok(layer) => Some(*layer),
                Err(_) => {
                    warn!(
                        producer = id.as_u64(),
                        "committed layer has unexpected type; discarding"
                    );
                    None
                }
            },
            Err(_) => {
                warn!(
                    producer = id.as_u64(),
                    "committed layer still borrowed; discarding"
                );
                None
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    #[must_use]
    pub const fn tx_id(&self) -> TxId {
        self.tx
    }
}

impl Drop for CommittedLayers {
    fn drop(&mut self) {
        if !self.layers.is_empty() {
            warn!(
                tx = self.tx.as_u64(),
                retained = self.layers.len(),
                "committed layers dropped without being applied"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_twice_fails() {
        begin_transaction().unwrap();
        assert_eq!(
            begin_transaction().unwrap_err(),
            TransactionError::TransactionAlreadyOpen
        );
        rollback().unwrap();
    }

    #[test]
    fn rollback_without_transaction_fails() {
        assert_eq!(rollback().unwrap_err(), TransactionError::NoTransactionOpen);
    }

    #[test]
    fn commit_without_transaction_fails() {
        assert!(commit().is_err());
    }

    #[test]
    fn layers_are_dropped_on_rollback() {
        begin_transaction().unwrap();
        let id = TransactionalId::next();
        with_layer_mut::<Vec<u32>, _>(id, |layer| layer.push(7)).unwrap();
        assert_eq!(open_layer_count(), 1);
        rollback().unwrap();
        assert_eq!(open_layer_count(), 0);
        assert!(with_layer::<Vec<u32>, _>(id, |_| ()).is_none());
    }

    #[test]
    fn commit_hands_layers_to_the_owner() {
        begin_transaction().unwrap();
        let id = TransactionalId::next();
        with_layer_mut::<Vec<u32>, _>(id, |layer| layer.extend([1, 2, 3])).unwrap();
        let mut committed = commit().unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed.take::<Vec<u32>>(id), Some(vec![1, 2, 3]));
        assert!(committed.is_empty());
        assert_eq!(open_layer_count(), 0);
    }

    #[test]
    fn no_layer_access_outside_transaction() {
        let id = TransactionalId::next();
        assert!(with_layer_mut::<Vec<u32>, _>(id, |_| ()).is_none());
    }
}
