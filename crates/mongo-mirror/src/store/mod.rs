//! Document store capability consumed by the transfer pipeline.

pub mod memory;
pub mod mongo;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use mongodb::bson::{Bson, Document};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EndpointConfig;
use crate::error::Result;

pub use memory::{MemoryConnector, MemoryStore};
pub use mongo::{MongoConnector, MongoStore};

/// Which side of the mirror an endpoint is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    /// Database documents are read from.
    Source,
    /// Database documents are written to.
    Destination,
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Destination => f.write_str("destination"),
        }
    }
}

/// Forward-only stream of documents returned by [`DocumentStore::find`].
///
/// The underlying server cursor is released when this value is dropped;
/// [`DocumentCursor::close`] makes that explicit at the end of a transfer.
pub struct DocumentCursor {
    inner: BoxStream<'static, Result<Document>>,
}

impl DocumentCursor {
    /// Wraps a document stream.
    pub fn new(inner: BoxStream<'static, Result<Document>>) -> Self {
        Self { inner }
    }

    /// Builds a cursor over documents already in memory.
    pub fn from_documents(documents: Vec<Document>) -> Self {
        Self::new(futures::stream::iter(documents.into_iter().map(Ok)).boxed())
    }

    /// Advances the cursor. `None` once exhausted.
    pub async fn next_document(&mut self) -> Option<Result<Document>> {
        self.inner.next().await
    }

    /// Releases the cursor.
    pub fn close(self) {
        drop(self.inner);
    }
}

impl fmt::Debug for DocumentCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentCursor").finish_non_exhaustive()
    }
}

/// Operations the mirror needs from a document database.
///
/// A store is bound to one database; collection names are passed per call.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Checks that the server answers.
    async fn ping(&self) -> Result<()>;

    /// Counts documents matching `filter`, capped at `limit` when set.
    async fn count(&self, collection: &str, filter: &Document, limit: Option<u64>) -> Result<u64>;

    /// Opens a cursor over documents matching `filter`.
    ///
    /// When `limit` is set it caps the number of documents and is used as the
    /// fetch batch size hint.
    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        limit: Option<u64>,
    ) -> Result<DocumentCursor>;

    /// Updates the document whose `id_field` equals `id` with the fields of
    /// `document`, inserting it if absent.
    async fn upsert(
        &self,
        collection: &str,
        id_field: &str,
        id: &Bson,
        document: &Document,
    ) -> Result<()>;

    /// Inserts every document in one batch.
    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<()>;
}

/// Opens [`DocumentStore`] handles for configured endpoints.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Connects to `endpoint` and pings it within `timeout`.
    async fn connect(
        &self,
        role: EndpointRole,
        endpoint: &EndpointConfig,
        timeout: Duration,
    ) -> Result<Arc<dyn DocumentStore>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[test]
    fn test_endpoint_role_display() {
        assert_eq!(EndpointRole::Source.to_string(), "source");
        assert_eq!(EndpointRole::Destination.to_string(), "destination");
    }

    #[tokio::test]
    async fn test_cursor_from_documents_yields_in_order() {
        let mut cursor = DocumentCursor::from_documents(vec![doc! { "n": 1 }, doc! { "n": 2 }]);
        let first = cursor.next_document().await.unwrap().unwrap();
        let second = cursor.next_document().await.unwrap().unwrap();
        assert_eq!(first.get_i32("n").unwrap(), 1);
        assert_eq!(second.get_i32("n").unwrap(), 2);
        assert!(cursor.next_document().await.is_none());
        cursor.close();
    }
}
