//! Destination side of a collection transfer.

use mongodb::bson::{Bson, Document};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::config::CollectionSpec;
use crate::error::{Error, Result};
use crate::identifier::uuid_to_binary;
use crate::report::{MirrorObserver, SilentObserver};
use crate::retry::{with_retry, RetryConfig};
use crate::store::{DocumentCursor, DocumentStore};

static SILENT: SilentObserver = SilentObserver;

/// Destination tenant written into every copied document.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantStamp {
    field: String,
    value: Bson,
}

impl TenantStamp {
    /// Creates a stamp writing `tenant` (binary form) into `field`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentifier`] if `tenant` is not a UUID.
    pub fn new(field: impl Into<String>, tenant: &str) -> Result<Self> {
        Ok(Self {
            field: field.into(),
            value: Bson::Binary(uuid_to_binary(tenant)?),
        })
    }

    /// Field the stamp writes.
    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Binary tenant value.
    #[must_use]
    pub fn value(&self) -> &Bson {
        &self.value
    }

    /// Overwrites the tenant field of `document`, whatever it held before.
    pub fn apply(&self, document: &mut Document) {
        document.insert(self.field.clone(), self.value.clone());
    }
}

/// How documents reach the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// One id-matched upsert per document, as the cursor streams.
    Upsert,
    /// Everything buffered, then a single `insert_many`.
    BulkInsert,
    /// Read and count only.
    DryRun,
}

impl WriteMode {
    /// Mode for `spec`, with dry run overriding the configured strategy.
    #[must_use]
    pub fn for_collection(spec: &CollectionSpec, dry_run: bool) -> Self {
        if dry_run {
            Self::DryRun
        } else if spec.is_upsert() {
            Self::Upsert
        } else {
            Self::BulkInsert
        }
    }
}

/// Drains source cursors into the destination store.
pub struct DestinationWriter<'a> {
    store: &'a dyn DocumentStore,
    id_field: &'a str,
    retry: &'a RetryConfig,
    stamp: Option<&'a TenantStamp>,
    observer: &'a dyn MirrorObserver,
}

impl<'a> DestinationWriter<'a> {
    /// Creates a writer matching documents on `id_field`.
    pub fn new(store: &'a dyn DocumentStore, id_field: &'a str, retry: &'a RetryConfig) -> Self {
        Self {
            store,
            id_field,
            retry,
            stamp: None,
            observer: &SILENT,
        }
    }

    /// Stamps every document with `stamp` before writing it.
    #[must_use]
    pub fn with_stamp(mut self, stamp: Option<&'a TenantStamp>) -> Self {
        self.stamp = stamp;
        self
    }

    /// Reports copied counts to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: &'a dyn MirrorObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Drains `cursor` into `collection` and returns the copied count.
    ///
    /// `copied` is updated as documents land, so a caller abandoning this
    /// future still sees the partial count. The cursor is closed on every
    /// return path.
    ///
    /// # Errors
    ///
    /// [`Error::SourceQueryFailed`] if the cursor fails to yield a document,
    /// [`Error::WriteFailed`] on the first rejected write or a document
    /// without an id in upsert mode.
    pub async fn drain(
        &self,
        collection: &str,
        mode: WriteMode,
        mut cursor: DocumentCursor,
        copied: &AtomicU64,
    ) -> Result<u64> {
        let result = self.drain_cursor(collection, mode, &mut cursor, copied).await;
        cursor.close();
        result
    }

    async fn drain_cursor(
        &self,
        collection: &str,
        mode: WriteMode,
        cursor: &mut DocumentCursor,
        copied: &AtomicU64,
    ) -> Result<u64> {
        let mut pending = Vec::new();

        while let Some(next) = cursor.next_document().await {
            let mut document = next.map_err(|e| Error::source_query(collection, e))?;
            if let Some(stamp) = self.stamp {
                stamp.apply(&mut document);
            }

            match mode {
                WriteMode::Upsert => {
                    self.upsert(collection, &document).await?;
                    self.record(collection, copied, 1);
                }
                WriteMode::BulkInsert => pending.push(document),
                WriteMode::DryRun => self.record(collection, copied, 1),
            }
        }

        if !pending.is_empty() {
            let batch = pending.len() as u64;
            debug!("Collection {}: inserting {} documents", collection, batch);
            self.store
                .insert_many(collection, pending)
                .await
                .map_err(|e| Error::write(collection, e))?;
            self.record(collection, copied, batch);
        }

        Ok(copied.load(Ordering::SeqCst))
    }

    async fn upsert(&self, collection: &str, document: &Document) -> Result<()> {
        let id = document
            .get(self.id_field)
            .ok_or_else(|| Error::WriteFailed {
                collection: collection.to_string(),
                message: format!("document has no '{}' field", self.id_field),
            })?;

        with_retry(self.retry, &format!("upsert {collection}"), || {
            self.store.upsert(collection, self.id_field, id, document)
        })
        .await
        .map_err(|e| Error::write(collection, e))
    }

    fn record(&self, collection: &str, copied: &AtomicU64, n: u64) {
        let total = copied.fetch_add(n, Ordering::SeqCst) + n;
        self.observer.documents_copied(collection, total);
    }
}

#[cfg(test)]
#[path = "writer_tests.rs"]
mod tests;
