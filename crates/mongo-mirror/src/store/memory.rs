//! In-process [`DocumentStore`] used by the test suites.
//!
//! Supports the filter subset the mirror itself produces: literal equality
//! on dotted paths, `$eq`, `$ne`, `$in`, `$nin`, `$exists`, and the logical
//! `$and` / `$or` / `$nor`. Equality is BSON equality, so `Int32(1)` and
//! `Int64(1)` do not match each other.

use async_trait::async_trait;
use mongodb::bson::{Bson, Document};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EndpointConfig;
use crate::error::{Error, Result};
use crate::store::{DocumentCursor, DocumentStore, EndpointRole, StoreConnector};

#[derive(Debug, Default)]
struct MemoryState {
    collections: HashMap<String, Vec<Document>>,
    unreachable: bool,
    writes_before_failure: Option<u64>,
    failing_reads: u32,
    count_calls: u64,
    find_calls: u64,
    upsert_calls: u64,
    insert_many_calls: u64,
    last_limit: Option<u64>,
}

/// Shared, cloneable in-memory database.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends documents to `collection`.
    pub fn insert(&self, collection: &str, documents: impl IntoIterator<Item = Document>) {
        self.state
            .lock()
            .collections
            .entry(collection.to_string())
            .or_default()
            .extend(documents);
    }

    /// Snapshot of a collection in insertion order.
    #[must_use]
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.state
            .lock()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Makes `ping` fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Lets `writes` more write calls succeed, then fails every write.
    pub fn fail_writes_after(&self, writes: u64) {
        self.state.lock().writes_before_failure = Some(writes);
    }

    /// Fails the next `times` count/find calls with a transient error.
    pub fn fail_next_reads(&self, times: u32) {
        self.state.lock().failing_reads = times;
    }

    /// Number of `count` calls served.
    #[must_use]
    pub fn count_calls(&self) -> u64 {
        self.state.lock().count_calls
    }

    /// Number of `find` calls served.
    #[must_use]
    pub fn find_calls(&self) -> u64 {
        self.state.lock().find_calls
    }

    /// Number of `upsert` calls received.
    #[must_use]
    pub fn upsert_calls(&self) -> u64 {
        self.state.lock().upsert_calls
    }

    /// Number of `insert_many` calls received.
    #[must_use]
    pub fn insert_many_calls(&self) -> u64 {
        self.state.lock().insert_many_calls
    }

    /// Limit passed to the most recent `count` or `find`.
    #[must_use]
    pub fn last_limit(&self) -> Option<u64> {
        self.state.lock().last_limit
    }

    fn check_read(state: &mut MemoryState) -> Result<()> {
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(Error::Store {
                message: "connection reset by peer".to_string(),
                transient: true,
            });
        }
        Ok(())
    }

    fn check_write(state: &mut MemoryState) -> Result<()> {
        match state.writes_before_failure {
            Some(0) => Err(Error::Store {
                message: "write rejected by server".to_string(),
                transient: false,
            }),
            Some(ref mut remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn matching(
        state: &MemoryState,
        collection: &str,
        filter: &Document,
        limit: Option<u64>,
    ) -> Vec<Document> {
        let cap = limit.map_or(usize::MAX, |n| usize::try_from(n).unwrap_or(usize::MAX));
        state
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| matches_filter(doc, filter))
                    .take(cap)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        if self.state.lock().unreachable {
            return Err(Error::Store {
                message: "server selection timeout".to_string(),
                transient: true,
            });
        }
        Ok(())
    }

    async fn count(&self, collection: &str, filter: &Document, limit: Option<u64>) -> Result<u64> {
        let mut state = self.state.lock();
        state.count_calls += 1;
        state.last_limit = limit;
        Self::check_read(&mut state)?;
        Ok(Self::matching(&state, collection, filter, limit).len() as u64)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        limit: Option<u64>,
    ) -> Result<DocumentCursor> {
        let mut state = self.state.lock();
        state.find_calls += 1;
        state.last_limit = limit;
        Self::check_read(&mut state)?;
        Ok(DocumentCursor::from_documents(Self::matching(
            &state, collection, filter, limit,
        )))
    }

    async fn upsert(
        &self,
        collection: &str,
        id_field: &str,
        id: &Bson,
        document: &Document,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.upsert_calls += 1;
        Self::check_write(&mut state)?;

        let docs = state.collections.entry(collection.to_string()).or_default();
        match docs.iter_mut().find(|doc| doc.get(id_field) == Some(id)) {
            Some(existing) => {
                for (key, value) in document {
                    existing.insert(key.clone(), value.clone());
                }
            }
            None => {
                let mut created = Document::new();
                created.insert(id_field, id.clone());
                for (key, value) in document {
                    created.insert(key.clone(), value.clone());
                }
                docs.push(created);
            }
        }
        Ok(())
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<()> {
        let mut state = self.state.lock();
        state.insert_many_calls += 1;
        Self::check_write(&mut state)?;
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .extend(documents);
        Ok(())
    }
}

/// Connector resolving connection strings to registered [`MemoryStore`]s.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    stores: HashMap<String, MemoryStore>,
    delay: Duration,
    attempts: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MemoryConnector {
    /// Creates a connector with no registered endpoints.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `store` under `connection_string`.
    #[must_use]
    pub fn with_store(mut self, connection_string: &str, store: MemoryStore) -> Self {
        self.stores.insert(connection_string.to_string(), store);
        self
    }

    /// Delays every connect, to observe overlapping connects and connect timeouts.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of connect calls made.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Highest number of connects that were in progress at the same time.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(
        &self,
        role: EndpointRole,
        endpoint: &EndpointConfig,
        timeout: Duration,
    ) -> Result<Arc<dyn DocumentStore>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = tokio::time::timeout(timeout, async {
            tokio::time::sleep(self.delay).await;
            let store = self
                .stores
                .get(&endpoint.connection_string)
                .cloned()
                .ok_or_else(|| Error::Store {
                    message: "no store registered for endpoint".to_string(),
                    transient: false,
                })?;
            store.ping().await?;
            Ok::<_, Error>(store)
        })
        .await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let store = result
            .map_err(|_| Error::Connection {
                role: role.to_string(),
                message: format!("no answer within {}s", timeout.as_secs()),
            })?
            .map_err(|e| Error::Connection {
                role: role.to_string(),
                message: e.to_string(),
            })?;
        Ok(Arc::new(store))
    }
}

/// Evaluates `filter` against `document`.
#[must_use]
pub fn matches_filter(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, condition)| match key.as_str() {
        "$and" => sub_filters(condition).all(|f| matches_filter(document, f)),
        "$or" => sub_filters(condition).any(|f| matches_filter(document, f)),
        "$nor" => !sub_filters(condition).any(|f| matches_filter(document, f)),
        path => field_matches(lookup(document, path), condition),
    })
}

fn sub_filters(condition: &Bson) -> impl Iterator<Item = &Document> {
    let items: &[Bson] = match condition {
        Bson::Array(items) => items,
        _ => &[],
    };
    items.iter().filter_map(Bson::as_document)
}

fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = document.get(parts.next()?)?;
    for part in parts {
        current = current.as_document()?.get(part)?;
    }
    Some(current)
}

fn field_matches(value: Option<&Bson>, condition: &Bson) -> bool {
    match condition {
        Bson::Document(ops) if ops.keys().next().is_some_and(|k| k.starts_with('$')) => ops
            .iter()
            .all(|(op, arg)| operator_matches(value, op, arg)),
        literal => equals(value, literal),
    }
}

fn operator_matches(value: Option<&Bson>, op: &str, arg: &Bson) -> bool {
    match op {
        "$eq" => equals(value, arg),
        "$ne" => !equals(value, arg),
        "$in" => arg
            .as_array()
            .is_some_and(|candidates| candidates.iter().any(|c| equals(value, c))),
        "$nin" => !arg
            .as_array()
            .is_some_and(|candidates| candidates.iter().any(|c| equals(value, c))),
        "$exists" => value.is_some() == truthy(arg),
        _ => false,
    }
}

fn equals(value: Option<&Bson>, literal: &Bson) -> bool {
    match value {
        Some(Bson::Array(items)) => {
            items.contains(literal) || matches!(literal, Bson::Array(l) if l == items)
        }
        Some(v) => v == literal,
        None => matches!(literal, Bson::Null),
    }
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Null => false,
        _ => true,
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
