use crate::{id::TransactionalId, registry::CommittedLayers};

///
/// TransactionalProducer
///
/// The layering contract every transactional structure implements: a
/// producer-specific layer type, a never-reused identity, and the merge
/// step that folds a committed layer into a fresh base. Sameness between
/// producers is always identity, never value equality.
///

pub trait TransactionalProducer {
    type Layer: 'static;

    /// Identity of this producer instance.
    fn transactional_id(&self) -> TransactionalId;

    /// Merge a committed layer into this producer's base state and assign
    /// a fresh identity, as if the producer had been replaced by its
    /// merged copy.
    fn apply_layer(&mut self, layer: Self::Layer);

    /// Pop this producer's layer from the committed set, if it mutated
    /// during the transaction, and apply it.
    fn apply_committed(&mut self, committed: &mut CommittedLayers) {
        if let Some(layer) = committed.take::<Self::Layer>(self.transactional_id()) {
            self.apply_layer(layer);
        }
    }
}
