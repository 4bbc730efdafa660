//! In-process document store
//!
//! [`MemoryStore`] keeps documents in insertion order and follows the
//! CouchDB contract closely enough to stand in for a server: `_id`/`_rev`
//! assignment, revision conflicts, design document hiding, `_find` field
//! projection and a change feed. Every call is counted so callers can
//! check how much traffic an operation caused, and failures can be
//! injected per partition or per batch.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::document::{is_design_document, ChangePage, Document, FeedCursor, SaveOutcome};
use crate::error::{Error, Result};
use crate::store::{ChangeFeed, DocumentStore, FeedOptions, FetchRequest, ReadSource};

/// Snapshot of how many times each store primitive was invoked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCalls {
    pub count: usize,
    pub fetch: usize,
    pub bulk_save: usize,
    pub create_database: usize,
    pub open_feed: usize,
    pub poll: usize,
}

impl StoreCalls {
    pub fn total(&self) -> usize {
        self.count + self.fetch + self.bulk_save + self.create_database + self.open_feed + self.poll
    }
}

#[derive(Debug, Default)]
struct Counters {
    count: AtomicUsize,
    fetch: AtomicUsize,
    bulk_save: AtomicUsize,
    create_database: AtomicUsize,
    open_feed: AtomicUsize,
    poll: AtomicUsize,
}

#[derive(Debug, Clone)]
enum FeedFault {
    Fail,
    Hang,
}

#[derive(Debug, Default)]
struct State {
    exists: bool,
    documents: Vec<Document>,
    next_id: u64,
    listings: HashMap<String, Vec<Document>>,
    change_pages: Option<Vec<Vec<Document>>>,
    feed_fault: Option<(usize, FeedFault)>,
    rejected_batches: Vec<(String, Value)>,
    failing_offsets: Vec<u64>,
    fetch_log: Vec<FetchRequest>,
}

/// Document store held entirely in memory
///
/// Cloning shares the underlying data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    name: String,
    state: Arc<Mutex<State>>,
    counters: Arc<Counters>,
}

impl MemoryStore {
    /// An existing, empty database
    pub fn new(name: impl Into<String>) -> Self {
        let store = Self::missing(name);
        store.lock().exists = true;
        store
    }

    /// A database that has not been created yet
    pub fn missing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(State::default())),
            counters: Arc::new(Counters::default()),
        }
    }

    /// An existing database holding `documents`
    pub fn with_documents(name: impl Into<String>, documents: Vec<Document>) -> Self {
        let store = Self::new(name);
        store.insert(documents);
        store
    }

    /// Insert documents directly, without counting a store call
    pub fn insert(&self, documents: Vec<Document>) {
        let mut state = self.lock();
        for doc in documents {
            state.upsert(doc);
        }
    }

    /// Rows served for a view or search index path
    pub fn with_listing(self, path: impl Into<String>, rows: Vec<Document>) -> Self {
        self.lock().listings.insert(path.into(), rows);
        self
    }

    /// Serve these pages from the change feed instead of the stored documents
    pub fn with_change_pages(self, pages: Vec<Vec<Document>>) -> Self {
        self.lock().change_pages = Some(pages);
        self
    }

    /// Fail every feed poll after `pages` successful ones
    pub fn fail_feed_after(self, pages: usize) -> Self {
        self.lock().feed_fault = Some((pages, FeedFault::Fail));
        self
    }

    /// Never answer feed polls after `pages` successful ones
    pub fn hang_feed_after(self, pages: usize) -> Self {
        self.lock().feed_fault = Some((pages, FeedFault::Hang));
        self
    }

    /// Fail any bulk save whose batch holds a document with `field == value`
    pub fn reject_batches_containing(self, field: impl Into<String>, value: Value) -> Self {
        self.lock().rejected_batches.push((field.into(), value));
        self
    }

    /// Fail range fetches starting at `offset`
    pub fn fail_fetch_at(self, offset: u64) -> Self {
        self.lock().failing_offsets.push(offset);
        self
    }

    pub fn exists(&self) -> bool {
        self.lock().exists
    }

    /// Stored documents, design documents included, in insertion order
    pub fn documents(&self) -> Vec<Document> {
        self.lock().documents.clone()
    }

    /// Every range fetch issued so far, in arrival order
    pub fn fetch_log(&self) -> Vec<FetchRequest> {
        self.lock().fetch_log.clone()
    }

    pub fn calls(&self) -> StoreCalls {
        let c = &self.counters;
        StoreCalls {
            count: c.count.load(Ordering::SeqCst),
            fetch: c.fetch.load(Ordering::SeqCst),
            bulk_save: c.bulk_save.load(Ordering::SeqCst),
            create_database: c.create_database.load(Ordering::SeqCst),
            open_feed: c.open_feed.load(Ordering::SeqCst),
            poll: c.poll.load(Ordering::SeqCst),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn not_found(&self) -> Error {
        Error::Http {
            status: 404,
            body: format!(r#"{{"error":"not_found","reason":"Database {} does not exist."}}"#, self.name),
        }
    }
}

impl State {
    fn listing(&self, source: &ReadSource) -> Result<Vec<Document>> {
        match source {
            ReadSource::AllDocs | ReadSource::Query => Ok(self
                .documents
                .iter()
                .filter(|d| !is_design_document(d))
                .cloned()
                .collect()),
            ReadSource::View(path) | ReadSource::Index(path) => {
                self.listings.get(path).cloned().ok_or_else(|| Error::Http {
                    status: 404,
                    body: format!(r#"{{"error":"not_found","reason":"missing {}"}}"#, path),
                })
            }
        }
    }

    fn upsert(&mut self, mut doc: Document) -> SaveOutcome {
        let id = match doc.get("_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                self.next_id += 1;
                format!("mem-{:08}", self.next_id)
            }
        };
        let given_rev = doc.get("_rev").and_then(Value::as_str).map(str::to_string);
        let existing = self
            .documents
            .iter()
            .position(|d| d.get("_id").and_then(Value::as_str) == Some(id.as_str()));

        let generation = match existing {
            Some(idx) => {
                let current = self.documents[idx]
                    .get("_rev")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if given_rev != current {
                    return SaveOutcome::rejected(
                        Some(id),
                        "conflict",
                        "Document update conflict.",
                    );
                }
                revision_generation(current.as_deref()) + 1
            }
            None => 1,
        };

        let rev = format!("{}-mem", generation);
        doc.insert("_id".to_string(), Value::String(id.clone()));
        doc.insert("_rev".to_string(), Value::String(rev.clone()));
        match existing {
            Some(idx) => self.documents[idx] = doc,
            None => self.documents.push(doc),
        }
        SaveOutcome::saved(id, rev)
    }
}

fn revision_generation(rev: Option<&str>) -> u64 {
    rev.and_then(|r| r.split('-').next())
        .and_then(|g| g.parse().ok())
        .unwrap_or(0)
}

fn project(doc: Document, fields: &[String]) -> Document {
    doc.into_iter()
        .filter(|(key, _)| key == "_id" || fields.iter().any(|f| f == key))
        .collect()
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn database_url(&self) -> String {
        format!("memory://{}", self.name)
    }

    async fn count_documents(&self, source: &ReadSource) -> Result<u64> {
        self.counters.count.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        if !state.exists {
            return Err(self.not_found());
        }
        Ok(state.listing(source)?.len() as u64)
    }

    async fn fetch_range(&self, request: &FetchRequest) -> Result<Vec<Document>> {
        self.counters.fetch.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        state.fetch_log.push(request.clone());
        if !state.exists {
            return Err(self.not_found());
        }
        if state.failing_offsets.contains(&request.offset) {
            return Err(Error::Http {
                status: 500,
                body: format!("injected failure at offset {}", request.offset),
            });
        }

        let rows = state
            .listing(&request.source)?
            .into_iter()
            .skip(request.offset as usize)
            .take(request.limit as usize);
        let documents = match (&request.source, &request.fields) {
            (ReadSource::Query, Some(fields)) => rows.map(|d| project(d, fields)).collect(),
            _ => rows.collect(),
        };
        Ok(documents)
    }

    async fn bulk_save(&self, documents: &[Document]) -> Result<Vec<SaveOutcome>> {
        self.counters.bulk_save.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if !state.exists {
            return Err(self.not_found());
        }
        let rejected = state.rejected_batches.iter().find(|(field, value)| {
            documents.iter().any(|d| d.get(field) == Some(value))
        });
        if let Some((field, value)) = rejected {
            return Err(Error::Http {
                status: 500,
                body: format!("injected failure for batch containing {}={}", field, value),
            });
        }

        Ok(documents.iter().cloned().map(|d| state.upsert(d)).collect())
    }

    async fn create_database_if_absent(&self) -> Result<()> {
        self.counters.create_database.fetch_add(1, Ordering::SeqCst);
        self.lock().exists = true;
        Ok(())
    }

    async fn open_change_feed(&self, options: &FeedOptions) -> Result<Box<dyn ChangeFeed>> {
        self.counters.open_feed.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        if !state.exists {
            return Err(self.not_found());
        }

        let pages = match &state.change_pages {
            Some(pages) => pages.clone(),
            None => {
                let docs: Vec<Document> = state
                    .documents
                    .iter()
                    .filter(|d| !is_design_document(d))
                    .cloned()
                    .collect();
                let chunk = options.limit.map(|l| l.max(1) as usize).unwrap_or(docs.len().max(1));
                docs.chunks(chunk).map(|c| c.to_vec()).collect()
            }
        };
        let position = match options.since.as_str() {
            "now" => pages.len(),
            since => since.parse::<usize>().unwrap_or(0).min(pages.len()),
        };

        Ok(Box::new(MemoryChangeFeed {
            cursor: FeedCursor::new(position.to_string()),
            position,
            pages,
            fault: state.feed_fault.clone(),
            delivered: 0,
            counters: Arc::clone(&self.counters),
        }))
    }
}

/// Change feed over a fixed list of pages; the cursor is the page index
#[derive(Debug)]
pub struct MemoryChangeFeed {
    pages: Vec<Vec<Document>>,
    position: usize,
    cursor: FeedCursor,
    fault: Option<(usize, FeedFault)>,
    delivered: usize,
    counters: Arc<Counters>,
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn poll(&mut self) -> Result<ChangePage> {
        self.counters.poll.fetch_add(1, Ordering::SeqCst);
        match &self.fault {
            Some((after, FeedFault::Fail)) if self.delivered >= *after => {
                return Err(Error::Transport("injected change feed failure".to_string()));
            }
            Some((after, FeedFault::Hang)) if self.delivered >= *after => {
                std::future::pending::<()>().await;
            }
            _ => {}
        }

        let documents = match self.pages.get(self.position) {
            Some(page) => {
                self.position += 1;
                page.clone()
            }
            None => Vec::new(),
        };
        self.delivered += 1;
        self.cursor = FeedCursor::new(self.position.to_string());

        let pending: usize = self.pages.iter().skip(self.position).map(Vec::len).sum();
        Ok(ChangePage {
            documents,
            last_seq: self.cursor.clone(),
            pending: Some(pending as u64),
        })
    }

    fn cursor(&self) -> &FeedCursor {
        &self.cursor
    }

    async fn close(&mut self) {
        self.position = self.pages.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_fetch_range_skips_design_documents() {
        let store = MemoryStore::with_documents(
            "db",
            vec![
                doc(json!({"_id": "_design/app"})),
                doc(json!({"_id": "a", "n": 1})),
                doc(json!({"_id": "b", "n": 2})),
            ],
        );

        assert_eq!(store.count_documents(&ReadSource::AllDocs).await.unwrap(), 2);
        let page = store
            .fetch_range(&FetchRequest::new(ReadSource::AllDocs, 1, 5))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0]["_id"], json!("b"));
    }

    #[tokio::test]
    async fn test_bulk_save_assigns_ids_and_detects_conflicts() {
        let store = MemoryStore::new("db");
        let outcomes = store
            .bulk_save(&[doc(json!({"name": "x"})), doc(json!({"_id": "fixed"}))])
            .await
            .unwrap();
        assert!(outcomes.iter().all(SaveOutcome::is_ok));
        assert_eq!(outcomes[1].rev.as_deref(), Some("1-mem"));

        // Same id without the current revision conflicts
        let outcomes = store.bulk_save(&[doc(json!({"_id": "fixed"}))]).await.unwrap();
        assert_eq!(outcomes[0].error.as_deref(), Some("conflict"));

        let outcomes = store
            .bulk_save(&[doc(json!({"_id": "fixed", "_rev": "1-mem", "v": 2}))])
            .await
            .unwrap();
        assert_eq!(outcomes[0].rev.as_deref(), Some("2-mem"));
        assert_eq!(store.documents().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_database_until_created() {
        let store = MemoryStore::missing("db");
        assert_eq!(
            store.bulk_save(&[doc(json!({}))]).await.unwrap_err().status(),
            Some(404)
        );

        store.create_database_if_absent().await.unwrap();
        store.create_database_if_absent().await.unwrap();
        assert!(store.exists());
        assert_eq!(store.calls().create_database, 2);
    }

    #[tokio::test]
    async fn test_query_source_projects_fields() {
        let store = MemoryStore::with_documents("db", vec![doc(json!({"_id": "a", "x": 1, "y": 2}))]);
        let request = FetchRequest::new(ReadSource::Query, 0, 10)
            .with_fields(Some(vec!["x".to_string()]));

        let page = store.fetch_range(&request).await.unwrap();
        assert_eq!(page[0], doc(json!({"_id": "a", "x": 1})));
    }

    #[tokio::test]
    async fn test_change_feed_pages_then_empty() {
        let store = MemoryStore::new("db").with_change_pages(vec![
            vec![doc(json!({"n": 1})), doc(json!({"n": 2}))],
            vec![doc(json!({"n": 3}))],
        ]);
        let mut feed = store.open_change_feed(&FeedOptions::default()).await.unwrap();

        let first = feed.poll().await.unwrap();
        assert_eq!(first.documents.len(), 2);
        assert_eq!(first.pending, Some(1));
        assert_eq!(feed.poll().await.unwrap().documents.len(), 1);
        assert!(feed.poll().await.unwrap().is_empty());
        assert_eq!(feed.cursor().as_str(), "2");
    }

    #[tokio::test]
    async fn test_change_feed_from_now_sees_nothing_old() {
        let store = MemoryStore::with_documents("db", vec![doc(json!({"n": 1}))]);
        let options = FeedOptions {
            since: FeedCursor::now(),
            ..FeedOptions::default()
        };
        let mut feed = store.open_change_feed(&options).await.unwrap();

        assert!(feed.poll().await.unwrap().is_empty());
    }
}
