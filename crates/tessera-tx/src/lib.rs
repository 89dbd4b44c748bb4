//! Transactional container primitives for Tessera.
//!
//! A container buffers mutations made inside a thread-bound transaction
//! into a per-producer diff layer instead of copying its base state.
//! Reads issued by the transaction's own thread see base and layer
//! combined; every other thread sees only the last committed base.
//! Commit merges each layer into a fresh base copy and re-identifies the
//! producer; rollback is a pure discard.

pub mod bitmap;
pub mod flag;
pub mod id;
pub mod map;
pub mod producer;
pub mod registry;
pub mod vec;

// re-exports
pub use bitmap::TransactionalBitmap;
pub use flag::TransactionalBool;
pub use id::{TransactionalId, TxId};
pub use map::TransactionalMap;
pub use producer::TransactionalProducer;
pub use registry::{CommittedLayers, TransactionError, begin_transaction, commit, rollback};
pub use vec::TransactionalVec;

pub mod prelude {
    pub use crate::{
        TransactionalBitmap, TransactionalBool, TransactionalId, TransactionalMap,
        TransactionalProducer, TransactionalVec,
    };
}
