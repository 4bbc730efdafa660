//! Schema acquisition for a new relation
//!
//! The configuration resolves to exactly one [`SchemaAcquisition`] before
//! any store call is made:
//!
//! 1. an explicit schema is used as given, with no store traffic;
//! 2. a regular endpoint, or any endpoint with a view or index, is sampled
//!    with one bulk fetch, except that the "all" sample size on a plain
//!    listing reads the whole database with a parallel partitioned scan and
//!    keeps the rows;
//! 3. otherwise the change feed is drained and every change is kept.

use couchdb_store::{Document, DocumentStore, FeedOptions, FetchRequest, ReadSource};
use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::SchemaRef;
use std::sync::Arc;
use tracing::info;

use crate::config::{CouchConfig, FeedMode, SampleSize};
use crate::convert::documents_to_batches;
use crate::error::{Error, Result};
use crate::partition::PartitionedReader;
use crate::receiver::{drain, ChangeFeedReceiver};
use crate::schema::infer_schema;

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaAcquisition {
    Explicit(SchemaRef),
    /// Parallel scan of every partition; rows are kept
    FullScan { source: ReadSource },
    /// One bulk fetch; `None` covers the whole listing
    Sample { source: ReadSource, limit: Option<u64> },
    /// Drain the change feed; rows are kept
    FeedDrain { options: FeedOptions },
}

impl SchemaAcquisition {
    pub fn from_config(config: &CouchConfig, explicit: Option<SchemaRef>) -> Self {
        if let Some(schema) = explicit {
            return SchemaAcquisition::Explicit(schema);
        }

        let secondary = config.secondary_source();
        if !config.is_feed_source() || secondary.is_some() {
            match (config.schema_sample_size, secondary) {
                (SampleSize::All, None) => SchemaAcquisition::FullScan {
                    source: config.read_source(),
                },
                (SampleSize::All, Some(source)) => SchemaAcquisition::Sample {
                    source,
                    limit: None,
                },
                (SampleSize::Limit(n), source) => SchemaAcquisition::Sample {
                    source: source.unwrap_or_else(|| config.read_source()),
                    limit: Some(n),
                },
            }
        } else {
            SchemaAcquisition::FeedDrain {
                options: config.feed_options(FeedMode::Drain),
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SchemaAcquisition::Explicit(_) => "explicit",
            SchemaAcquisition::FullScan { .. } => "full_scan",
            SchemaAcquisition::Sample { .. } => "sample",
            SchemaAcquisition::FeedDrain { .. } => "feed_drain",
        }
    }
}

/// Schema of a new relation, plus its rows when acquisition read them all
#[derive(Debug, Clone)]
pub struct ResolvedSchema {
    pub schema: SchemaRef,
    /// One inner vector per partition
    pub dataset: Option<Vec<Vec<RecordBatch>>>,
}

#[derive(Debug, Clone)]
pub struct SchemaResolver {
    store: Arc<dyn DocumentStore>,
    config: CouchConfig,
}

impl SchemaResolver {
    pub fn new(store: Arc<dyn DocumentStore>, config: CouchConfig) -> Self {
        Self { store, config }
    }

    pub async fn resolve(&self, explicit: Option<SchemaRef>) -> Result<ResolvedSchema> {
        self.config.validate()?;
        let acquisition = SchemaAcquisition::from_config(&self.config, explicit);
        info!(
            database = %self.store.database_url(),
            strategy = acquisition.name(),
            "Resolving schema"
        );

        match acquisition {
            SchemaAcquisition::Explicit(schema) => Ok(ResolvedSchema {
                schema,
                dataset: None,
            }),
            SchemaAcquisition::FullScan { source } => self.full_scan(source).await,
            SchemaAcquisition::Sample { source, limit } => self.sample(source, limit).await,
            SchemaAcquisition::FeedDrain { options } => self.drain_feed(options).await,
        }
    }

    async fn full_scan(&self, source: ReadSource) -> Result<ResolvedSchema> {
        let reader = PartitionedReader::new(self.store.clone(), source, self.config.page_length);
        let partitions = reader.fetch_all().await?;
        let schema = infer_schema(partitions.iter().flatten());
        let dataset = partitions
            .iter()
            .map(|documents| documents_to_batches(documents, &schema))
            .collect::<Result<Vec<_>>>()?;

        info!(
            fields = schema.fields().len(),
            partitions = dataset.len(),
            rows = partitions.iter().map(Vec::len).sum::<usize>(),
            "Inferred schema from full scan"
        );
        Ok(ResolvedSchema {
            schema,
            dataset: Some(dataset),
        })
    }

    async fn sample(&self, source: ReadSource, limit: Option<u64>) -> Result<ResolvedSchema> {
        let limit = match limit {
            Some(n) => n,
            None => self
                .store
                .count_documents(&source)
                .await
                .map_err(|e| Error::store_access(format!("count {}", source), e))?,
        };
        let request = FetchRequest::new(source.clone(), 0, limit);
        let documents = self
            .store
            .fetch_range(&request)
            .await
            .map_err(|e| Error::store_access(format!("sample {} [0, {})", source, limit), e))?;

        let schema = infer_schema(&documents);
        info!(
            source = %source,
            sampled = documents.len(),
            fields = schema.fields().len(),
            "Inferred schema from sample"
        );
        Ok(ResolvedSchema {
            schema,
            dataset: None,
        })
    }

    async fn drain_feed(&self, options: FeedOptions) -> Result<ResolvedSchema> {
        let receiver = ChangeFeedReceiver::new(self.store.clone(), options, FeedMode::Drain);
        let feed_url = receiver.feed_url();
        let documents: Vec<Document> = drain(receiver).await?;

        if documents.is_empty() {
            return Err(Error::SchemaInference {
                source_url: feed_url,
                message: "change feed returned no documents; check that the database exists \
                          and is reachable"
                    .to_string(),
            });
        }

        let schema = infer_schema(&documents);
        let batches = documents_to_batches(&documents, &schema)?;
        info!(
            feed = %feed_url,
            rows = documents.len(),
            fields = schema.fields().len(),
            "Inferred schema from drained change feed"
        );
        Ok(ResolvedSchema {
            schema,
            dataset: Some(vec![batches]),
        })
    }
}
