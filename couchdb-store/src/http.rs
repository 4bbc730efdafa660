//! CouchDB HTTP API client
//!
//! Implements [`DocumentStore`] against a CouchDB (or Cloudant) server:
//! `_all_docs`, `_find`, views and search indexes for reads, `_bulk_docs`
//! for writes and `_changes` long-polling for the change feed.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

use crate::document::{is_design_document, ChangePage, Document, FeedCursor, SaveOutcome};
use crate::error::{Error, Result};
use crate::store::{ChangeFeed, DocumentStore, FeedOptions, FetchRequest, ReadSource};

/// Search indexes cap a single page at this many rows
const SEARCH_PAGE_LIMIT: u64 = 200;

/// Extra time a long-poll request gets on top of the server-side timeout
const FEED_REQUEST_GRACE: Duration = Duration::from_secs(10);

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

/// HTTP client for one CouchDB database
///
/// # Example
/// ```no_run
/// use couchdb_store::{CouchClient, DocumentStore, ReadSource};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = CouchClient::new("http://localhost:5984", "movies")
///     .with_credentials("admin", Some("secret".to_string()));
/// let total = client.count_documents(&ReadSource::AllDocs).await?;
/// println!("movies has {} documents", total);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CouchClient {
    base_url: String,
    database: String,
    credentials: Option<(String, Option<String>)>,
    client: reqwest::Client,
}

/// Response shape shared by `_all_docs` and views
#[derive(Debug, Deserialize)]
pub struct ViewResponse {
    #[serde(default)]
    pub total_rows: u64,
    #[serde(default)]
    pub rows: Vec<ViewRow>,
}

#[derive(Debug, Deserialize)]
pub struct ViewRow {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub key: Value,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub doc: Option<Value>,
}

/// Response from `_find`
#[derive(Debug, Deserialize)]
pub struct FindResponse {
    pub docs: Vec<Document>,
}

/// Response from a search index
#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub total_rows: u64,
    #[serde(default)]
    pub bookmark: Option<String>,
    #[serde(default)]
    pub rows: Vec<ViewRow>,
}

/// Response from `_changes?feed=longpoll`
#[derive(Debug, Deserialize)]
pub struct ChangesResponse {
    pub results: Vec<ChangeRow>,
    pub last_seq: Value,
    #[serde(default)]
    pub pending: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeRow {
    #[serde(default)]
    pub seq: Value,
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub doc: Option<Document>,
}

impl ViewRow {
    /// Turn a listing row into a document.
    ///
    /// Prefers the included document, then an object-valued row value,
    /// and otherwise keeps the row's `id`, `key` and `value`.
    fn into_document(self) -> Document {
        if let Some(Value::Object(doc)) = self.doc {
            return doc;
        }
        match self.value {
            Value::Object(value) => value,
            value => {
                let mut doc = Map::new();
                if let Some(id) = self.id {
                    doc.insert("_id".to_string(), Value::String(id));
                }
                doc.insert("key".to_string(), self.key);
                doc.insert("value".to_string(), value);
                doc
            }
        }
    }
}

impl CouchClient {
    /// Create a client for `database` on the server at `base_url`
    ///
    /// # Example
    /// ```
    /// use couchdb_store::CouchClient;
    ///
    /// let client = CouchClient::new("http://localhost:5984/", "movies");
    /// assert_eq!(client.database(), "movies");
    /// ```
    pub fn new(base_url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            database: database.into(),
            credentials: None,
            client: reqwest::Client::new(),
        }
    }

    /// Authenticate every request with HTTP basic auth
    pub fn with_credentials(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.credentials = Some((username.into(), password));
        self
    }

    /// Bound every non-feed request by `timeout`
    pub fn with_request_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    fn db_url(&self) -> String {
        format!("{}/{}", self.base_url, self.database.replace('/', "%2F"))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.db_url(), path.trim_start_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, password.as_ref()),
            None => request,
        }
    }

    async fn get_view(&self, path: &str, query: &[(&str, String)]) -> Result<ViewResponse> {
        let request = self.authorize(self.client.get(self.endpoint(path)).query(query));
        let response = check_status(request.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn get_search(&self, path: &str, query: &[(&str, String)]) -> Result<SearchResponse> {
        let request = self.authorize(self.client.get(self.endpoint(path)).query(query));
        let response = check_status(request.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn find(&self, request: &FetchRequest) -> Result<Vec<Document>> {
        let mut body = json!({
            "selector": request.selector.clone().unwrap_or_else(|| json!({"_id": {"$gt": null}})),
            "skip": request.offset,
            "limit": request.limit,
        });
        if let Some(fields) = &request.fields {
            body["fields"] = json!(fields);
        }

        let http = self.authorize(self.client.post(self.endpoint("_find")).json(&body));
        let response = check_status(http.send().await?).await?;
        let found: FindResponse = response.json().await?;
        Ok(found.docs)
    }

    /// Search indexes page by bookmark only, so earlier rows are walked
    /// and dropped to reach `offset`.
    async fn search_range(&self, path: &str, offset: u64, limit: u64) -> Result<Vec<Document>> {
        let wanted = offset + limit;
        let mut seen = 0u64;
        let mut bookmark: Option<String> = None;
        let mut documents = Vec::new();

        while seen < wanted {
            let page_limit = SEARCH_PAGE_LIMIT.min(wanted - seen);
            let mut query = vec![
                ("q", "*:*".to_string()),
                ("include_docs", "true".to_string()),
                ("limit", page_limit.to_string()),
            ];
            if let Some(mark) = &bookmark {
                query.push(("bookmark", mark.clone()));
            }

            let page = self.get_search(path, &query).await?;
            if page.rows.is_empty() {
                break;
            }
            for row in page.rows {
                if seen >= offset {
                    documents.push(row.into_document());
                }
                seen += 1;
            }
            bookmark = page.bookmark;
        }

        Ok(documents)
    }
}

/// Turn non-success responses into [`Error::Http`]
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    Err(Error::Http {
        status: response.status().as_u16(),
        body: response.text().await.unwrap_or_default(),
    })
}

fn without_design_documents(docs: impl IntoIterator<Item = Document>) -> Vec<Document> {
    docs.into_iter().filter(|d| !is_design_document(d)).collect()
}

#[async_trait]
impl DocumentStore for CouchClient {
    fn database_url(&self) -> String {
        self.db_url()
    }

    async fn count_documents(&self, source: &ReadSource) -> Result<u64> {
        let limit = ("limit", "0".to_string());
        let total = match source {
            ReadSource::AllDocs | ReadSource::Query => {
                self.get_view("_all_docs", &[limit]).await?.total_rows
            }
            ReadSource::View(path) => self.get_view(path, &[limit]).await?.total_rows,
            ReadSource::Index(path) => {
                self.get_search(path, &[("q", "*:*".to_string()), limit])
                    .await?
                    .total_rows
            }
        };
        debug!(database = %self.database, source = %source, total, "counted documents");
        Ok(total)
    }

    async fn fetch_range(&self, request: &FetchRequest) -> Result<Vec<Document>> {
        let page = [
            ("include_docs", "true".to_string()),
            ("skip", request.offset.to_string()),
            ("limit", request.limit.to_string()),
        ];
        let documents = match &request.source {
            ReadSource::AllDocs => self
                .get_view("_all_docs", &page)
                .await?
                .rows
                .into_iter()
                .filter_map(|row| match row.doc {
                    Some(Value::Object(doc)) => Some(doc),
                    _ => None,
                })
                .collect(),
            ReadSource::Query => self.find(request).await?,
            ReadSource::View(path) => self
                .get_view(path, &page)
                .await?
                .rows
                .into_iter()
                .map(ViewRow::into_document)
                .collect(),
            ReadSource::Index(path) => {
                self.search_range(path, request.offset, request.limit)
                    .await?
            }
        };
        Ok(without_design_documents(documents))
    }

    async fn bulk_save(&self, documents: &[Document]) -> Result<Vec<SaveOutcome>> {
        let body = json!({ "docs": documents });
        let request = self.authorize(self.client.post(self.endpoint("_bulk_docs")).json(&body));
        let response = check_status(request.send().await?).await?;
        let outcomes: Vec<SaveOutcome> = response.json().await?;

        if outcomes.len() != documents.len() {
            return Err(Error::InvalidResponse(format!(
                "_bulk_docs returned {} results for {} documents",
                outcomes.len(),
                documents.len()
            )));
        }
        Ok(outcomes)
    }

    async fn create_database_if_absent(&self) -> Result<()> {
        let request = self.authorize(self.client.put(self.db_url()));
        let response = request.send().await?;

        // 412 Precondition Failed: the database already exists
        if response.status().as_u16() == 412 {
            debug!(database = %self.database, "database already exists");
            return Ok(());
        }
        check_status(response).await?;
        debug!(database = %self.database, "created database");
        Ok(())
    }

    async fn open_change_feed(&self, options: &FeedOptions) -> Result<Box<dyn ChangeFeed>> {
        Ok(Box::new(HttpChangeFeed {
            client: self.clone(),
            options: options.clone(),
            cursor: options.since.clone(),
            closed: false,
        }))
    }
}

/// Long-poll subscription to `_changes`
///
/// Each poll is one `feed=longpoll` request; deleted documents and design
/// documents are dropped from the page.
#[derive(Debug)]
pub struct HttpChangeFeed {
    client: CouchClient,
    options: FeedOptions,
    cursor: FeedCursor,
    closed: bool,
}

impl HttpChangeFeed {
    fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("feed", "longpoll".to_string()),
            ("include_docs", "true".to_string()),
            ("since", self.cursor.to_string()),
            ("timeout", self.options.poll_timeout.as_millis().to_string()),
        ];
        if let Some(limit) = self.options.limit {
            query.push(("limit", limit.to_string()));
        }
        if self.options.selector.is_some() {
            query.push(("filter", "_selector".to_string()));
        }
        query
    }
}

#[async_trait]
impl ChangeFeed for HttpChangeFeed {
    async fn poll(&mut self) -> Result<ChangePage> {
        if self.closed {
            return Err(Error::Unsupported("poll on a closed change feed".to_string()));
        }

        let url = self.client.endpoint("_changes");
        let request = match &self.options.selector {
            Some(selector) => self
                .client
                .client
                .post(url)
                .json(&json!({ "selector": selector })),
            None => self.client.client.get(url),
        };
        let request = self
            .client
            .authorize(request.query(&self.query()))
            .timeout(self.options.poll_timeout + FEED_REQUEST_GRACE);

        let response = check_status(request.send().await?).await?;
        let changes: ChangesResponse = response.json().await?;

        let last_seq = FeedCursor::from_value(&changes.last_seq).ok_or_else(|| {
            Error::InvalidResponse(format!("unusable last_seq {}", changes.last_seq))
        })?;
        let documents = without_design_documents(
            changes
                .results
                .into_iter()
                .filter(|row| !row.deleted)
                .filter_map(|row| row.doc),
        );

        self.cursor = last_seq.clone();
        Ok(ChangePage {
            documents,
            last_seq,
            pending: changes.pending,
        })
    }

    fn cursor(&self) -> &FeedCursor {
        &self.cursor
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = CouchClient::new("http://localhost:5984/", "movies");
        assert_eq!(client.base_url, "http://localhost:5984");
        assert_eq!(client.database_url(), "http://localhost:5984/movies");
    }

    #[test]
    fn test_database_name_with_slash_is_escaped() {
        let client = CouchClient::new("http://localhost:5984", "team/movies");
        assert_eq!(client.database_url(), "http://localhost:5984/team%2Fmovies");
    }

    #[test]
    fn test_deserialize_all_docs_response() {
        let json = r#"{"total_rows": 2, "offset": 0, "rows": [
            {"id": "a", "key": "a", "value": {"rev": "1-x"}, "doc": {"_id": "a", "n": 1}},
            {"id": "b", "key": "b", "value": {"rev": "1-y"}, "doc": {"_id": "b", "n": 2}}
        ]}"#;
        let response: ViewResponse = serde_json::from_str(json).unwrap();

        assert_eq!(response.total_rows, 2);
        let docs: Vec<Document> = response
            .rows
            .into_iter()
            .map(ViewRow::into_document)
            .collect();
        assert_eq!(docs[1]["n"], json!(2));
    }

    #[test]
    fn test_view_row_with_scalar_value_keeps_key_and_value() {
        let row: ViewRow =
            serde_json::from_str(r#"{"id": "x", "key": "drama", "value": 3}"#).unwrap();
        let doc = row.into_document();

        assert_eq!(doc["_id"], json!("x"));
        assert_eq!(doc["key"], json!("drama"));
        assert_eq!(doc["value"], json!(3));
    }

    #[test]
    fn test_deserialize_changes_response() {
        let json = r#"{"results": [
            {"seq": "1-a", "id": "a", "changes": [{"rev": "1-x"}], "doc": {"_id": "a"}},
            {"seq": "2-b", "id": "b", "changes": [{"rev": "2-y"}], "deleted": true}
        ], "last_seq": "2-b", "pending": 0}"#;
        let response: ChangesResponse = serde_json::from_str(json).unwrap();

        assert_eq!(response.results.len(), 2);
        assert!(response.results[1].deleted);
        assert_eq!(response.pending, Some(0));
    }
}
