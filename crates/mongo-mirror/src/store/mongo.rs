//! MongoDB implementation of [`DocumentStore`].

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::{ErrorKind, RETRYABLE_WRITE_ERROR};
use mongodb::options::{ClientOptions, CountOptions, FindOptions, UpdateOptions};
use mongodb::{Client, Collection, Database};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::EndpointConfig;
use crate::error::{Error, Result};
use crate::store::{DocumentCursor, DocumentStore, EndpointRole, StoreConnector};

const APP_NAME: &str = "mongo-mirror";

/// Converts a driver error, flagging network-level failures as transient.
fn store_error(err: mongodb::error::Error) -> Error {
    let transient = err.contains_label(RETRYABLE_WRITE_ERROR)
        || matches!(
            *err.kind,
            ErrorKind::Io(_)
                | ErrorKind::ServerSelection { .. }
                | ErrorKind::ConnectionPoolCleared { .. }
        );
    Error::Store {
        message: err.to_string(),
        transient,
    }
}

/// A MongoDB database handle.
#[derive(Debug, Clone)]
pub struct MongoStore {
    database: Database,
}

impl MongoStore {
    /// Wraps a database of an existing client.
    pub fn new(client: Client, database: &str) -> Self {
        Self {
            database: client.database(database),
        }
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection::<Document>(name)
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn ping(&self) -> Result<()> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn count(&self, collection: &str, filter: &Document, limit: Option<u64>) -> Result<u64> {
        let mut options = CountOptions::default();
        options.limit = limit;

        self.collection(collection)
            .count_documents(filter.clone())
            .with_options(options)
            .await
            .map_err(store_error)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        limit: Option<u64>,
    ) -> Result<DocumentCursor> {
        let mut options = FindOptions::default();
        if let Some(limit) = limit {
            options.limit = Some(i64::try_from(limit).unwrap_or(i64::MAX));
            options.batch_size = Some(u32::try_from(limit).unwrap_or(u32::MAX));
        }

        let cursor = self
            .collection(collection)
            .find(filter.clone())
            .with_options(options)
            .await
            .map_err(store_error)?;

        Ok(DocumentCursor::new(cursor.map_err(store_error).boxed()))
    }

    async fn upsert(
        &self,
        collection: &str,
        id_field: &str,
        id: &Bson,
        document: &Document,
    ) -> Result<()> {
        let mut options = UpdateOptions::default();
        options.upsert = Some(true);

        let mut selector = Document::new();
        selector.insert(id_field, id.clone());

        self.collection(collection)
            .update_one(selector, doc! { "$set": set_body(id_field, document) })
            .with_options(options)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<()> {
        self.collection(collection)
            .insert_many(documents)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

/// Opens [`MongoStore`] handles.
#[derive(Debug, Clone, Copy, Default)]
pub struct MongoConnector;

impl MongoConnector {
    async fn open(endpoint: &EndpointConfig, timeout: Duration) -> Result<MongoStore> {
        let mut options = ClientOptions::parse(&endpoint.connection_string)
            .await
            .map_err(store_error)?;
        options.app_name = Some(APP_NAME.to_string());
        options.connect_timeout = Some(timeout);
        options.server_selection_timeout = Some(timeout);

        let client = Client::with_options(options).map_err(store_error)?;
        let store = MongoStore::new(client, &endpoint.database);
        store.ping().await?;
        Ok(store)
    }
}

#[async_trait]
impl StoreConnector for MongoConnector {
    async fn connect(
        &self,
        role: EndpointRole,
        endpoint: &EndpointConfig,
        timeout: Duration,
    ) -> Result<Arc<dyn DocumentStore>> {
        info!("Connecting to {} {}", role, endpoint.redacted());

        let store = tokio::time::timeout(timeout, Self::open(endpoint, timeout))
            .await
            .map_err(|_| Error::Connection {
                role: role.to_string(),
                message: format!("no answer within {}s", timeout.as_secs()),
            })?
            .map_err(|e| Error::Connection {
                role: role.to_string(),
                message: e.to_string(),
            })?;

        debug!("Ping to {} database '{}' succeeded", role, endpoint.database);
        info!("Connected to {}", role);
        Ok(Arc::new(store))
    }
}

/// `$set` body for an upsert matched on `id_field`.
///
/// `_id` is immutable, so it is only set when it is the match key. A
/// document inserted through the upsert still gets a server-generated `_id`.
fn set_body(id_field: &str, document: &Document) -> Document {
    let mut body = document.clone();
    if id_field != "_id" {
        body.remove("_id");
    }
    body
}

#[cfg(test)]
#[path = "mongo_tests.rs"]
mod tests;
