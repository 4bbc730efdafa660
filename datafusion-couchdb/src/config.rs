//! Connection and behaviour settings for a CouchDB-backed table
//!
//! A [`CouchConfig`] can be built in code, deserialized with serde, or
//! parsed from a string option map (`CREATE EXTERNAL TABLE ... OPTIONS`).
//! [`CouchConfig::validate`] runs before any network call.

use couchdb_store::{FeedCursor, FeedOptions, ReadSource};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_URL: &str = "http://127.0.0.1:5984";
pub const DEFAULT_BULK_SIZE: usize = 200;
pub const DEFAULT_PAGE_LENGTH: u64 = 10_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 8_000;

/// How many documents schema inference samples
///
/// `-1` in option maps and serialized configs means [`SampleSize::All`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum SampleSize {
    #[default]
    All,
    Limit(u64),
}

impl SampleSize {
    pub const ALL_SENTINEL: i64 = -1;
}

impl TryFrom<i64> for SampleSize {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            Self::ALL_SENTINEL => Ok(SampleSize::All),
            n if n >= 0 => Ok(SampleSize::Limit(n as u64)),
            n => Err(Error::Configuration(format!(
                "schema_sample_size must be -1 or a non-negative integer, got {}",
                n
            ))),
        }
    }
}

impl From<SampleSize> for i64 {
    fn from(size: SampleSize) -> Self {
        match size {
            SampleSize::All => SampleSize::ALL_SENTINEL,
            SampleSize::Limit(n) => i64::try_from(n).unwrap_or(i64::MAX),
        }
    }
}

impl fmt::Display for SampleSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleSize::All => f.write_str("all"),
            SampleSize::Limit(n) => write!(f, "{}", n),
        }
    }
}

/// Where table rows come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Endpoint {
    #[default]
    #[serde(rename = "_all_docs")]
    AllDocs,
    #[serde(rename = "_changes")]
    Changes,
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "_all_docs" => Ok(Endpoint::AllDocs),
            "_changes" => Ok(Endpoint::Changes),
            other => Err(Error::Configuration(format!(
                "unknown endpoint '{}', expected _all_docs or _changes",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedMode {
    /// Stop at the first empty page
    #[default]
    Drain,
    /// Keep polling until the subscription is stopped
    Continuous,
}

impl FromStr for FeedMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "drain" => Ok(FeedMode::Drain),
            "continuous" => Ok(FeedMode::Continuous),
            other => Err(Error::Configuration(format!(
                "unknown feed_mode '{}', expected drain or continuous",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CouchConfig {
    pub url: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub endpoint: Endpoint,
    /// View path, e.g. `_design/app/_view/by_year`
    pub view: Option<String>,
    /// Search index path, e.g. `_design/app/_search/titles`
    pub index: Option<String>,
    /// Read through `_find`, which honours projection and filters
    pub use_query: bool,
    pub schema_sample_size: SampleSize,
    pub create_db_on_save: bool,
    pub bulk_size: usize,
    pub page_length: u64,
    pub feed_mode: FeedMode,
    pub poll_interval_ms: u64,
    pub feed_batch_limit: Option<u64>,
    pub feed_since: Option<String>,
    pub selector: Option<Value>,
    pub request_timeout_ms: Option<u64>,
}

impl Default for CouchConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            database: String::new(),
            username: None,
            password: None,
            endpoint: Endpoint::default(),
            view: None,
            index: None,
            use_query: false,
            schema_sample_size: SampleSize::default(),
            create_db_on_save: false,
            bulk_size: DEFAULT_BULK_SIZE,
            page_length: DEFAULT_PAGE_LENGTH,
            feed_mode: FeedMode::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            feed_batch_limit: None,
            feed_since: None,
            selector: None,
            request_timeout_ms: None,
        }
    }
}

impl CouchConfig {
    pub fn new(url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: database.into(),
            ..Self::default()
        }
    }

    /// Parse a string option map; keys are case-insensitive.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in options {
            let value = value.trim();
            match key.to_ascii_lowercase().as_str() {
                "url" => config.url = value.to_string(),
                "database" => config.database = value.to_string(),
                "username" => config.username = Some(value.to_string()),
                "password" => config.password = Some(value.to_string()),
                "endpoint" => config.endpoint = value.parse()?,
                "view" => config.view = non_empty(value),
                "index" => config.index = non_empty(value),
                "use_query" => config.use_query = parse_option(key, value)?,
                "schema_sample_size" => {
                    let n: i64 = parse_option(key, value)?;
                    config.schema_sample_size = SampleSize::try_from(n)?;
                }
                "create_db_on_save" => config.create_db_on_save = parse_option(key, value)?,
                "bulk_size" => config.bulk_size = parse_option(key, value)?,
                "page_length" => config.page_length = parse_option(key, value)?,
                "feed_mode" => config.feed_mode = value.parse()?,
                "poll_interval_ms" => config.poll_interval_ms = parse_option(key, value)?,
                "feed_batch_limit" => config.feed_batch_limit = Some(parse_option(key, value)?),
                "feed_since" => config.feed_since = non_empty(value),
                "selector" => {
                    config.selector = Some(serde_json::from_str(value).map_err(|e| {
                        Error::Configuration(format!("selector is not valid JSON: {}", e))
                    })?)
                }
                "request_timeout_ms" => {
                    config.request_timeout_ms = Some(parse_option(key, value)?)
                }
                other => {
                    return Err(Error::Configuration(format!("unknown option '{}'", other)));
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::Configuration("url must not be empty".to_string()));
        }
        if self.database.trim().is_empty() {
            return Err(Error::Configuration("database must be set".to_string()));
        }
        if self.view.is_some() && self.index.is_some() {
            return Err(Error::Configuration(
                "view and index are mutually exclusive".to_string(),
            ));
        }
        if self.bulk_size == 0 {
            return Err(Error::Configuration("bulk_size must be positive".to_string()));
        }
        if self.page_length == 0 {
            return Err(Error::Configuration("page_length must be positive".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Configuration(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if let Some(selector) = &self.selector {
            if !selector.is_object() {
                return Err(Error::Configuration(format!(
                    "selector must be a JSON object, got {}",
                    selector
                )));
            }
        }
        Ok(())
    }

    /// View or search index path, when one is configured
    pub fn secondary_source(&self) -> Option<ReadSource> {
        match (&self.view, &self.index) {
            (Some(view), _) => Some(ReadSource::View(view.clone())),
            (None, Some(index)) => Some(ReadSource::Index(index.clone())),
            (None, None) => None,
        }
    }

    /// The listing paginated reads walk
    pub fn read_source(&self) -> ReadSource {
        self.secondary_source().unwrap_or(if self.use_query {
            ReadSource::Query
        } else {
            ReadSource::AllDocs
        })
    }

    pub fn is_feed_source(&self) -> bool {
        self.endpoint == Endpoint::Changes
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Feed options for a subscription in `mode`.
    ///
    /// Without `feed_since`, drains start at the beginning of history and
    /// continuous tails start at the current end.
    pub fn feed_options(&self, mode: FeedMode) -> FeedOptions {
        let since = match (&self.feed_since, mode) {
            (Some(since), _) => FeedCursor::new(since.clone()),
            (None, FeedMode::Drain) => FeedCursor::beginning(),
            (None, FeedMode::Continuous) => FeedCursor::now(),
        };
        FeedOptions {
            since,
            poll_timeout: self.poll_interval(),
            limit: self.feed_batch_limit,
            selector: self.selector.clone(),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_option<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse().map_err(|e: T::Err| {
        Error::Configuration(format!("invalid value '{}' for option '{}': {}", value, key, e))
    })
}
