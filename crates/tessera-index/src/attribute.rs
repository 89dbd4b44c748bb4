//! Per-entity-type container routing attribute values to their indexes.

use crate::{
    RecordId,
    filter::{FilterIndex, FilterIndexError},
    key::{AttributeKey, AttributeSchema, Locale},
    sort::{SortIndex, SortIndexError},
    storage::StoragePart,
    unique::{UniqueIndex, UniqueIndexError},
    value::Value,
};
use tessera_tx::{CommittedLayers, TransactionalMap, TransactionalProducer};
use thiserror::Error as ThisError;
use tracing::debug;

///
/// AttributeIndexError
///

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum AttributeIndexError {
    #[error("attribute {attribute} is localized but no locale was supplied")]
    MissingLocale { attribute: String },

    #[error("attribute {attribute}: locale {locale} is not allowed for this entity type")]
    LocaleNotAllowed { attribute: String, locale: Locale },

    #[error("attribute {attribute} is not localized but locale {locale} was supplied")]
    UnexpectedLocale { attribute: String, locale: Locale },

    #[error("attribute {attribute}: index not reachable after creation")]
    IndexUnavailable { attribute: String },

    #[error(transparent)]
    Unique(#[from] UniqueIndexError),

    #[error(transparent)]
    Filter(#[from] FilterIndexError),

    #[error(transparent)]
    Sort(#[from] SortIndexError),
}

///
/// AttributeIndex
///
/// One instance per entity type. Holds the unique, filter and sort
/// indexes keyed by `(attribute name, locale)`, creates an index lazily
/// on first registration and drops it again when its last record leaves.
/// Index membership itself is transactional: an index created inside a
/// transaction disappears on rollback.
///
/// The locale contract is enforced here, before any index mutates: a
/// localized attribute requires a locale from the entity's allowed set,
/// a global attribute must not carry one.
///

#[derive(Debug, Default)]
pub struct AttributeIndex {
    unique_indexes: TransactionalMap<AttributeKey, UniqueIndex>,
    filter_indexes: TransactionalMap<AttributeKey, FilterIndex>,
    sort_indexes: TransactionalMap<AttributeKey, SortIndex>,
}

impl AttributeIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            unique_indexes: TransactionalMap::new(),
            filter_indexes: TransactionalMap::new(),
            sort_indexes: TransactionalMap::new(),
        }
    }

    // --- Unique attributes ---

    pub fn insert_unique_attribute(
        &mut self,
        schema: &AttributeSchema,
        allowed_locales: &[Locale],
        locale: Option<&Locale>,
        value: &Value,
        record_id: RecordId,
    ) -> Result<(), AttributeIndexError> {
        let key = Self::checked_key(schema, allowed_locales, locale)?;
        if !self.unique_indexes.contains_key(&key) {
            debug!(attribute = %key, "unique index created");
            self.unique_indexes
                .insert(key.clone(), UniqueIndex::new(key.clone(), schema.value_type));
        }

        self.unique_indexes
            .with_value_mut(&key, |index| index.register_unique_key(value, record_id))
            .ok_or_else(|| AttributeIndexError::IndexUnavailable {
                attribute: schema.name.clone(),
            })??;

        Ok(())
    }

    pub fn remove_unique_attribute(
        &mut self,
        schema: &AttributeSchema,
        allowed_locales: &[Locale],
        locale: Option<&Locale>,
        value: &Value,
        record_id: RecordId,
    ) -> Result<(), AttributeIndexError> {
        let key = Self::checked_key(schema, allowed_locales, locale)?;
        let result = self
            .unique_indexes
            .with_value_mut(&key, |index| index.unregister_unique_key(value, record_id))
            .unwrap_or_else(|| {
                Err(UniqueIndexError::OwnershipMismatch {
                    attribute: schema.name.clone(),
                    value: value.clone(),
                    expected: record_id,
                    actual: None,
                })
            });
        result?;

        self.drop_unique_if_empty(&key);

        Ok(())
    }

    // --- Filter attributes ---

    pub fn insert_filter_attribute(
        &mut self,
        schema: &AttributeSchema,
        allowed_locales: &[Locale],
        locale: Option<&Locale>,
        value: &Value,
        record_id: RecordId,
    ) -> Result<(), AttributeIndexError> {
        let key = Self::checked_key(schema, allowed_locales, locale)?;
        if !self.filter_indexes.contains_key(&key) {
            debug!(attribute = %key, "filter index created");
            self.filter_indexes
                .insert(key.clone(), FilterIndex::new(key.clone(), schema.value_type));
        }

        self.filter_indexes
            .with_value_mut(&key, |index| index.add_record(record_id, value))
            .ok_or_else(|| AttributeIndexError::IndexUnavailable {
                attribute: schema.name.clone(),
            })??;

        Ok(())
    }

    pub fn remove_filter_attribute(
        &mut self,
        schema: &AttributeSchema,
        allowed_locales: &[Locale],
        locale: Option<&Locale>,
        value: &Value,
        record_id: RecordId,
    ) -> Result<(), AttributeIndexError> {
        let key = Self::checked_key(schema, allowed_locales, locale)?;
        let result = self
            .filter_indexes
            .with_value_mut(&key, |index| index.remove_record(record_id, value))
            .unwrap_or_else(|| {
                Err(FilterIndexError::RecordNotRegistered {
                    attribute: schema.name.clone(),
                    record_id,
                    value: value.clone(),
                })
            });
        result?;

        self.drop_filter_if_empty(&key);

        Ok(())
    }

    // --- Sort attributes ---

    pub fn insert_sort_attribute(
        &mut self,
        schema: &AttributeSchema,
        allowed_locales: &[Locale],
        locale: Option<&Locale>,
        value: &Value,
        record_id: RecordId,
    ) -> Result<(), AttributeIndexError> {
        let key = Self::checked_key(schema, allowed_locales, locale)?;
        if !self.sort_indexes.contains_key(&key) {
            debug!(attribute = %key, "sort index created");
            self.sort_indexes
                .insert(key.clone(), SortIndex::new(key.clone(), schema.value_type));
        }

        self.sort_indexes
            .with_value_mut(&key, |index| index.add_record(value, record_id))
            .ok_or_else(|| AttributeIndexError::IndexUnavailable {
                attribute: schema.name.clone(),
            })??;

        Ok(())
    }

    pub fn remove_sort_attribute(
        &mut self,
        schema: &AttributeSchema,
        allowed_locales: &[Locale],
        locale: Option<&Locale>,
        value: &Value,
        record_id: RecordId,
    ) -> Result<(), AttributeIndexError> {
        let key = Self::checked_key(schema, allowed_locales, locale)?;
        let result = self
            .sort_indexes
            .with_value_mut(&key, |index| index.remove_record(value, record_id))
            .unwrap_or_else(|| {
                Err(SortIndexError::OwnershipMismatch {
                    attribute: schema.name.clone(),
                    value: value.clone(),
                    record_id,
                })
            });
        result?;

        self.drop_sort_if_empty(&key);

        Ok(())
    }

    // --- Reads ---

    pub fn with_unique_index<R>(
        &self,
        key: &AttributeKey,
        f: impl FnOnce(&UniqueIndex) -> R,
    ) -> Option<R> {
        self.unique_indexes.with_value(key, f)
    }

    pub fn with_filter_index<R>(
        &self,
        key: &AttributeKey,
        f: impl FnOnce(&FilterIndex) -> R,
    ) -> Option<R> {
        self.filter_indexes.with_value(key, f)
    }

    pub fn with_sort_index<R>(
        &self,
        key: &AttributeKey,
        f: impl FnOnce(&SortIndex) -> R,
    ) -> Option<R> {
        self.sort_indexes.with_value(key, f)
    }

    #[must_use]
    pub fn unique_index_keys(&self) -> Vec<AttributeKey> {
        self.unique_indexes.visible_keys()
    }

    #[must_use]
    pub fn filter_index_keys(&self) -> Vec<AttributeKey> {
        self.filter_indexes.visible_keys()
    }

    #[must_use]
    pub fn sort_index_keys(&self) -> Vec<AttributeKey> {
        self.sort_indexes.visible_keys()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unique_indexes.is_empty()
            && self.filter_indexes.is_empty()
            && self.sort_indexes.is_empty()
    }

    // --- Persistence surface ---

    /// Snapshots of every index mutated since the last
    /// [`Self::reset_dirty`], for the persistence collaborator to flush.
    #[must_use]
    pub fn modified_storage_parts(&self, entity_index_pk: u32) -> Vec<StoragePart> {
        let mut parts = Vec::new();

        self.unique_indexes.for_each_visible(|_, index| {
            if index.is_dirty() {
                parts.push(StoragePart::Unique(index.create_storage_part(entity_index_pk)));
            }
        });
        self.filter_indexes.for_each_visible(|_, index| {
            if index.is_dirty() {
                parts.push(StoragePart::Filter(index.create_storage_part(entity_index_pk)));
            }
        });
        self.sort_indexes.for_each_visible(|_, index| {
            if index.is_dirty() {
                parts.push(StoragePart::Sort(index.create_storage_part(entity_index_pk)));
            }
        });

        parts
    }

    /// Mark every index clean, after its parts were flushed.
    pub fn reset_dirty(&mut self) {
        for key in self.unique_indexes.visible_keys() {
            self.unique_indexes.with_value_mut(&key, UniqueIndex::reset_dirty);
        }
        for key in self.filter_indexes.visible_keys() {
            self.filter_indexes.with_value_mut(&key, FilterIndex::reset_dirty);
        }
        for key in self.sort_indexes.visible_keys() {
            self.sort_indexes.with_value_mut(&key, SortIndex::reset_dirty);
        }
    }

    // --- Transaction plumbing ---

    pub fn apply_committed(&mut self, committed: &mut CommittedLayers) {
        // drain the layers of every index that existed before the
        // transaction first, so an index emptied and dropped inside it
        // does not leave its layers behind
        self.apply_committed_to_indexes(committed);

        self.unique_indexes.apply_committed(committed);
        self.filter_indexes.apply_committed(committed);
        self.sort_indexes.apply_committed(committed);

        // indexes first created inside the transaction enter the bases
        // only with the map layers above
        self.apply_committed_to_indexes(committed);
    }

    fn apply_committed_to_indexes(&mut self, committed: &mut CommittedLayers) {
        if committed.is_empty() {
            return;
        }

        for key in self.unique_indexes.visible_keys() {
            self.unique_indexes
                .with_value_mut(&key, |index| index.apply_committed(committed));
        }
        for key in self.filter_indexes.visible_keys() {
            self.filter_indexes
                .with_value_mut(&key, |index| index.apply_committed(committed));
        }
        for key in self.sort_indexes.visible_keys() {
            self.sort_indexes
                .with_value_mut(&key, |index| index.apply_committed(committed));
        }
    }

    // --- Internals ---

    fn drop_unique_if_empty(&mut self, key: &AttributeKey) {
        let empty = self
            .unique_indexes
            .with_value(key, UniqueIndex::is_empty)
            .unwrap_or(false);
        if empty {
            debug!(attribute = %key, "unique index dropped");
            self.unique_indexes.remove(key);
        }
    }

    fn drop_filter_if_empty(&mut self, key: &AttributeKey) {
        let empty = self
            .filter_indexes
            .with_value(key, FilterIndex::is_empty)
            .unwrap_or(false);
        if empty {
            debug!(attribute = %key, "filter index dropped");
            self.filter_indexes.remove(key);
        }
    }

    fn drop_sort_if_empty(&mut self, key: &AttributeKey) {
        let empty = self
            .sort_indexes
            .with_value(key, SortIndex::is_empty)
            .unwrap_or(false);
        if empty {
            debug!(attribute = %key, "sort index dropped");
            self.sort_indexes.remove(key);
        }
    }

    fn checked_key(
        schema: &AttributeSchema,
        allowed_locales: &[Locale],
        locale: Option<&Locale>,
    ) -> Result<AttributeKey, AttributeIndexError> {
        match (schema.localized, locale) {
            (true, None) => Err(AttributeIndexError::MissingLocale {
                attribute: schema.name.clone(),
            }),
            (true, Some(locale)) if !allowed_locales.contains(locale) => {
                Err(AttributeIndexError::LocaleNotAllowed {
                    attribute: schema.name.clone(),
                    locale: locale.clone(),
                })
            }
            (true, Some(locale)) => Ok(AttributeKey::localized(&schema.name, locale.clone())),
            (false, Some(locale)) => Err(AttributeIndexError::UnexpectedLocale {
                attribute: schema.name.clone(),
                locale: locale.clone(),
            }),
            (false, None) => Ok(AttributeKey::global(&schema.name)),
        }
    }
}
