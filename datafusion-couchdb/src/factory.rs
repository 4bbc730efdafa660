//! `CREATE EXTERNAL TABLE ... STORED AS COUCHDB` support
//!
//! ```sql
//! CREATE EXTERNAL TABLE movies
//! STORED AS COUCHDB
//! LOCATION 'http://127.0.0.1:5984/movies'
//! OPTIONS ('schema_sample_size' '200', 'use_query' 'true');
//! ```
//!
//! The location may name the server only, with the database given as the
//! `database` option. Columns declared in the statement replace schema
//! discovery.

use async_trait::async_trait;
use datafusion::catalog::{Session, TableProviderFactory};
use datafusion::datasource::TableProvider;
use datafusion::error::Result as DataFusionResult;
use datafusion::execution::session_state::SessionState;
use datafusion::logical_expr::CreateExternalTable;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::CouchConfig;
use crate::table::CouchTable;

/// Name used after `STORED AS`
pub const FILE_TYPE: &str = "COUCHDB";

#[derive(Debug, Default)]
pub struct CouchTableFactory;

impl CouchTableFactory {
    pub fn new() -> Self {
        Self
    }

    /// Make `STORED AS COUCHDB` available in `state`
    pub fn register(state: &mut SessionState) {
        state
            .table_factories_mut()
            .insert(FILE_TYPE.to_string(), Arc::new(Self::new()));
    }
}

#[async_trait]
impl TableProviderFactory for CouchTableFactory {
    async fn create(
        &self,
        _state: &dyn Session,
        cmd: &CreateExternalTable,
    ) -> DataFusionResult<Arc<dyn TableProvider>> {
        let mut options = table_options(&cmd.options);
        apply_location(&cmd.location, &mut options);
        let config = CouchConfig::from_options(&options)?;

        let schema = (!cmd.schema.fields().is_empty()).then(|| Arc::new(cmd.schema.as_arrow().clone()));
        let table = CouchTable::connect(config, schema).await?;
        Ok(Arc::new(table))
    }
}

/// DataFusion qualifies unprefixed `OPTIONS` keys as `format.<key>`
const FORMAT_PREFIX: &str = "format.";

fn table_options(options: &HashMap<String, String>) -> HashMap<String, String> {
    options
        .iter()
        .map(|(key, value)| {
            let key = match key.get(..FORMAT_PREFIX.len()) {
                Some(prefix) if prefix.eq_ignore_ascii_case(FORMAT_PREFIX) => {
                    &key[FORMAT_PREFIX.len()..]
                }
                _ => key.as_str(),
            };
            (key.to_string(), value.clone())
        })
        .collect()
}

/// Fill `url` and `database` from a table location not already covered by
/// explicit options
fn apply_location(location: &str, options: &mut HashMap<String, String>) {
    let location = location.trim().trim_end_matches('/');
    if location.is_empty() {
        return;
    }

    let has_database = options.keys().any(|k| k.eq_ignore_ascii_case("database"));
    let (url, database) = match location.rsplit_once('/') {
        Some((base, name)) if !has_database && base.contains("://") => (base, Some(name)),
        _ => (location, None),
    };

    if !options.keys().any(|k| k.eq_ignore_ascii_case("url")) {
        options.insert("url".to_string(), url.to_string());
    }
    if let Some(database) = database {
        options.insert("database".to_string(), database.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn located(location: &str, pairs: &[(&str, &str)]) -> HashMap<String, String> {
        let mut options: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        apply_location(location, &mut options);
        options
    }

    #[test]
    fn test_format_prefix_is_stripped() {
        let raw: HashMap<String, String> = [
            ("format.schema_sample_size", "-1"),
            ("FORMAT.use_query", "true"),
            ("page_length", "50"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut options = table_options(&raw);
        apply_location("http://127.0.0.1:5984/movies", &mut options);
        let config = CouchConfig::from_options(&options).unwrap();

        assert!(config.use_query);
        assert_eq!(config.page_length, 50);
        assert_eq!(config.database, "movies");
    }

    #[test]
    fn test_location_with_database() {
        let options = located("http://127.0.0.1:5984/movies/", &[]);
        assert_eq!(options["url"], "http://127.0.0.1:5984");
        assert_eq!(options["database"], "movies");
    }

    #[test]
    fn test_location_server_only() {
        let options = located("https://acct.cloudant.com", &[("database", "movies")]);
        assert_eq!(options["url"], "https://acct.cloudant.com");
        assert_eq!(options["database"], "movies");

        let options = located("https://acct.cloudant.com", &[]);
        assert_eq!(options["url"], "https://acct.cloudant.com");
        assert!(!options.contains_key("database"));
    }

    #[test]
    fn test_explicit_options_win() {
        let options = located(
            "http://a:5984/x",
            &[("url", "http://b:5984"), ("database", "y")],
        );
        assert_eq!(options["url"], "http://b:5984");
        assert_eq!(options["database"], "y");
    }
}
