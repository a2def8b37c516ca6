//! Source side of a collection transfer: limit resolution, count, cursor.

use mongodb::bson::Document;
use tracing::{debug, info};

use crate::config::CollectionSpec;
use crate::error::{Error, Result};
use crate::retry::{with_retry, RetryConfig};
use crate::store::{DocumentCursor, DocumentStore};

/// Batch-size keyword meaning "no limit".
pub const ALL: &str = "all";

/// Resolves a configured batch size into an optional document cap.
///
/// Unset and `all` (any case) mean no cap.
///
/// # Errors
///
/// Returns [`Error::InvalidBatchSize`] for zero, negative or non-numeric
/// values.
pub fn resolve_limit(collection: &str, batch_size: Option<&str>) -> Result<Option<u64>> {
    let raw = match batch_size.map(str::trim) {
        None | Some("") => return Ok(None),
        Some(raw) if raw.eq_ignore_ascii_case(ALL) => return Ok(None),
        Some(raw) => raw,
    };

    match raw.parse::<u64>() {
        Ok(limit) if limit > 0 => Ok(Some(limit)),
        _ => Err(Error::InvalidBatchSize {
            collection: collection.to_string(),
            value: raw.to_string(),
        }),
    }
}

/// An opened source query: how many documents will be read and the cursor
/// that yields them.
#[derive(Debug)]
pub struct OpenedSource {
    /// Documents matching the filter, capped at the limit.
    pub matched: u64,
    /// Cursor over the same documents.
    pub cursor: DocumentCursor,
}

/// Reads one collection at a time from the source store.
pub struct SourceReader<'a> {
    store: &'a dyn DocumentStore,
    retry: &'a RetryConfig,
}

impl<'a> SourceReader<'a> {
    /// Creates a reader over `store`.
    pub fn new(store: &'a dyn DocumentStore, retry: &'a RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Counts the documents matching `filter` and opens a cursor over them.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidBatchSize`] for a bad batch size,
    /// [`Error::SourceQueryFailed`] when the store rejects the count or find.
    pub async fn open(&self, spec: &CollectionSpec, filter: &Document) -> Result<OpenedSource> {
        let limit = resolve_limit(&spec.name, spec.batch_size.as_deref())?;
        debug!("Collection {} filter: {} limit: {:?}", spec.name, filter, limit);

        let matched = with_retry(self.retry, &format!("count {}", spec.name), || {
            self.store.count(&spec.name, filter, limit)
        })
        .await
        .map_err(|e| Error::source_query(&spec.name, e))?;

        info!("Collection {} has {} documents to be imported", spec.name, matched);

        let cursor = with_retry(self.retry, &format!("find {}", spec.name), || {
            self.store.find(&spec.name, filter, limit)
        })
        .await
        .map_err(|e| Error::source_query(&spec.name, e))?;

        Ok(OpenedSource { matched, cursor })
    }
}
