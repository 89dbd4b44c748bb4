use std::sync::atomic::{AtomicU64, Ordering};

// Identifiers are never reused for the lifetime of the process; the
// counters are global, monotonic and never reset. Stale cache keys built
// from an old identity can therefore never collide with a live producer.
static NEXT_PRODUCER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

///
/// TransactionalId
///
/// Opaque identity of one transactional producer instance. Two producers
/// with identical contents are still distinct producers; committing a
/// layer always yields a producer with a fresh identity.
///

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TransactionalId(u64);

impl TransactionalId {
    #[must_use]
    pub(crate) fn next() -> Self {
        Self(NEXT_PRODUCER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild an identity from its persisted numeric form. Only meant
    /// for rehydrating dependency-id sets recorded by a cache or
    /// serialization collaborator; never use it to mint fresh ids.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

///
/// TxId
///
/// Identity of one thread-bound transaction.
///

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TxId(u64);

impl TxId {
    #[must_use]
    pub(crate) fn next() -> Self {
        Self(NEXT_TX_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_ids_are_monotonic_and_unique() {
        let a = TransactionalId::next();
        let b = TransactionalId::next();
        let c = TransactionalId::next();
        assert!(a < b && b < c);
    }

    #[test]
    fn tx_ids_are_never_recycled() {
        let first = TxId::next();
        for _ in 0..100 {
            let _ = TxId::next();
        }
        assert!(TxId::next() > first);
    }
}
