//! Store abstraction consumed by the DataFusion integration
//!
//! Everything the integration does against the database goes through
//! [`DocumentStore`], so the same partitioning, write and change-feed logic
//! runs against a live server ([`crate::CouchClient`]) or an in-process
//! store ([`crate::MemoryStore`]).

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::document::{ChangePage, Document, FeedCursor, SaveOutcome};
use crate::error::Result;

/// Which listing a paginated read walks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadSource {
    /// Primary index (`_all_docs`)
    AllDocs,
    /// Mango query endpoint (`_find`); honours field projection and selectors
    Query,
    /// Map/reduce view, e.g. `_design/ddoc/_view/by_name`
    View(String),
    /// Search index, e.g. `_design/ddoc/_search/fulltext`
    Index(String),
}

impl fmt::Display for ReadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadSource::AllDocs => f.write_str("_all_docs"),
            ReadSource::Query => f.write_str("_find"),
            ReadSource::View(path) | ReadSource::Index(path) => f.write_str(path),
        }
    }
}

/// One offset/limit slice of a listing
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub source: ReadSource,
    pub offset: u64,
    pub limit: u64,
    /// Advisory projection; ignored by sources without pushdown
    pub fields: Option<Vec<String>>,
    /// Advisory Mango selector; ignored by sources without pushdown
    pub selector: Option<Value>,
}

impl FetchRequest {
    pub fn new(source: ReadSource, offset: u64, limit: u64) -> Self {
        Self {
            source,
            offset,
            limit,
            fields: None,
            selector: None,
        }
    }

    pub fn with_fields(mut self, fields: Option<Vec<String>>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_selector(mut self, selector: Option<Value>) -> Self {
        self.selector = selector;
        self
    }
}

/// Where and how a change feed subscription starts
#[derive(Debug, Clone, PartialEq)]
pub struct FeedOptions {
    pub since: FeedCursor,
    /// How long one long-poll may block before returning an empty page
    pub poll_timeout: Duration,
    /// Upper bound on changes per page
    pub limit: Option<u64>,
    /// Server-side Mango filter applied to the feed
    pub selector: Option<Value>,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            since: FeedCursor::beginning(),
            poll_timeout: Duration::from_secs(8),
            limit: None,
            selector: None,
        }
    }
}

/// Paginated access to one database
#[async_trait]
pub trait DocumentStore: fmt::Debug + Send + Sync {
    /// URL of the database, used to name the store in diagnostics
    fn database_url(&self) -> String;

    /// Number of rows in a listing, as reported up front by the server
    async fn count_documents(&self, source: &ReadSource) -> Result<u64>;

    /// Fetch rows `[offset, offset + limit)` of a listing.
    ///
    /// Design documents are never returned.
    async fn fetch_range(&self, request: &FetchRequest) -> Result<Vec<Document>>;

    /// Save documents in one request; one outcome per input document
    async fn bulk_save(&self, documents: &[Document]) -> Result<Vec<SaveOutcome>>;

    /// Create the database, succeeding when it already exists
    async fn create_database_if_absent(&self) -> Result<()>;

    async fn open_change_feed(&self, options: &FeedOptions) -> Result<Box<dyn ChangeFeed>>;

    /// Whether `fields` and `selector` on a [`FetchRequest`] reach the server
    fn supports_pushdown(&self, source: &ReadSource) -> bool {
        matches!(source, ReadSource::Query)
    }
}

/// An open long-poll subscription
#[async_trait]
pub trait ChangeFeed: Send {
    /// Block until the server returns changes or the poll timeout elapses.
    ///
    /// An elapsed timeout yields an empty page. The feed advances its
    /// cursor to the page's `last_seq`.
    async fn poll(&mut self) -> Result<ChangePage>;

    /// Cursor the next poll starts from
    fn cursor(&self) -> &FeedCursor;

    /// Release the subscription; further polls are not expected
    async fn close(&mut self);
}
