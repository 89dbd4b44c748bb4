use crate::{
    id::TransactionalId,
    producer::TransactionalProducer,
    registry,
};

///
/// TransactionalBool
///
/// A single transactional flag, used for per-index dirty markers. The
/// layer is just the pending value.
///

#[derive(Debug)]
pub struct TransactionalBool {
    id: TransactionalId,
    base: bool,
}

#[derive(Debug, Default)]
pub struct BoolChanges {
    value: bool,
}

impl TransactionalBool {
    #[must_use]
    pub fn new(value: bool) -> Self {
        Self {
            id: TransactionalId::next(),
            base: value,
        }
    }

    pub fn set(&mut self, value: bool) {
        if registry::transaction_open() {
            let _ = registry::with_layer_mut::<BoolChanges, _>(self.id, |layer| {
                layer.value = value;
            });
        } else {
            self.base = value;
        }
    }

    #[must_use]
    pub fn get(&self) -> bool {
        registry::with_layer::<BoolChanges, _>(self.id, |layer| layer.value)
            .unwrap_or(self.base)
    }
}

impl Default for TransactionalBool {
    fn default() -> Self {
        Self::new(false)
    }
}

impl TransactionalProducer for TransactionalBool {
    type Layer = BoolChanges;

    fn transactional_id(&self) -> TransactionalId {
        self.id
    }

    fn apply_layer(&mut self, layer: Self::Layer) {
        self.base = layer.value;
        self.id = TransactionalId::next();
    }
}
