use async_trait::async_trait;
use couchdb_store::{CouchClient, DocumentStore};
use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::catalog::Session;
use datafusion::common::not_impl_err;
use datafusion::datasource::{MemTable, TableProvider};
use datafusion::error::{DataFusionError, Result as DataFusionResult};
use datafusion::execution::SendableRecordBatchStream;
use datafusion::logical_expr::dml::InsertOp;
use datafusion::logical_expr::{Expr, TableProviderFilterPushDown, TableType};
use datafusion::physical_plan::empty::EmptyExec;
use datafusion::physical_plan::insert::DataSinkExec;
use datafusion::physical_plan::stream::RecordBatchStreamAdapter;
use datafusion::physical_plan::ExecutionPlan;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::any::Any;
use std::sync::Arc;
use tracing::warn;

use crate::config::CouchConfig;
use crate::convert::documents_to_batches;
use crate::error::{Error, Result};
use crate::exec::CouchExec;
use crate::filter;
use crate::partition::PartitionedReader;
use crate::receiver::ChangeFeedReceiver;
use crate::resolver::SchemaResolver;
use crate::schema::{create_projected_schema, projected_field_names};
use crate::sink::CouchSink;
use crate::writer::PartitionedWriter;

/// TableProvider for one CouchDB database
///
/// The schema is fixed when the table is created. When schema discovery
/// had to read every row (full scan or change-feed drain) those rows are
/// kept and served from memory; otherwise each scan reads the store.
#[derive(Debug)]
pub struct CouchTable {
    store: Arc<dyn DocumentStore>,
    config: CouchConfig,
    schema: SchemaRef,
    dataset: Option<Vec<Vec<RecordBatch>>>,
}

impl CouchTable {
    /// Connect to the server named in `config` over HTTP
    pub async fn connect(config: CouchConfig, schema: Option<SchemaRef>) -> Result<Self> {
        config.validate()?;

        let mut client = CouchClient::new(config.url.clone(), config.database.clone());
        if let Some(username) = &config.username {
            client = client.with_credentials(username.clone(), config.password.clone());
        }
        if let Some(timeout) = config.request_timeout() {
            client = client
                .with_request_timeout(timeout)
                .map_err(|e| Error::store_access("build http client", e))?;
        }

        Self::try_new(Arc::new(client), config, schema).await
    }

    /// Create a table over any store; `schema` skips discovery
    pub async fn try_new(
        store: Arc<dyn DocumentStore>,
        config: CouchConfig,
        schema: Option<SchemaRef>,
    ) -> Result<Self> {
        let resolved = SchemaResolver::new(store.clone(), config.clone())
            .resolve(schema)
            .await?;

        Ok(Self {
            store,
            config,
            schema: resolved.schema,
            dataset: resolved.dataset,
        })
    }

    pub fn config(&self) -> &CouchConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Whether scans are served from rows read during schema discovery
    pub fn is_materialized(&self) -> bool {
        self.dataset.is_some()
    }

    fn writer(&self) -> PartitionedWriter {
        PartitionedWriter::new(
            self.store.clone(),
            self.config.bulk_size,
            self.config.create_db_on_save,
        )
    }

    /// Save `partitions` to the store, returning the number of documents
    /// written.
    ///
    /// The store cannot truncate a database, so `overwrite` appends.
    pub async fn insert(&self, partitions: Vec<Vec<RecordBatch>>, overwrite: bool) -> Result<u64> {
        if overwrite {
            warn_overwrite(&self.store);
        }
        self.writer().write(partitions).await?.into_result()
    }

    /// Tail the change feed as record batches in this table's schema.
    ///
    /// Uses the configured feed mode: a drain ends at the first empty page,
    /// a continuous tail runs until the stream is dropped. Must be called
    /// from within a Tokio runtime.
    pub fn changes_stream(&self) -> SendableRecordBatchStream {
        let receiver = ChangeFeedReceiver::new(
            self.store.clone(),
            self.config.feed_options(self.config.feed_mode),
            self.config.feed_mode,
        );
        let (handle, batches) = receiver.spawn();
        let schema = self.schema.clone();

        // The handle lives as long as the stream; dropping it stops the task
        let changes = stream::unfold((handle, batches), |(handle, mut batches)| async move {
            let next = batches.recv().await?;
            Some((next, (handle, batches)))
        })
        .map(move |next| -> DataFusionResult<Vec<RecordBatch>> {
            let batch = next?;
            Ok(documents_to_batches(&batch.documents, &schema)?)
        })
        .map_ok(|batches| stream::iter(batches.into_iter().map(Ok::<_, DataFusionError>)))
        .try_flatten();

        Box::pin(RecordBatchStreamAdapter::new(self.schema.clone(), changes))
    }
}

fn warn_overwrite(store: &Arc<dyn DocumentStore>) {
    warn!(
        database = %store.database_url(),
        "Overwrite requested but documents cannot be truncated; appending instead"
    );
}

#[async_trait]
impl TableProvider for CouchTable {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn table_type(&self) -> TableType {
        TableType::Base
    }

    async fn scan(
        &self,
        state: &dyn Session,
        projection: Option<&Vec<usize>>,
        filters: &[Expr],
        limit: Option<usize>,
    ) -> DataFusionResult<Arc<dyn ExecutionPlan>> {
        if let Some(dataset) = &self.dataset {
            let table = MemTable::try_new(self.schema.clone(), dataset.clone())?;
            return table.scan(state, projection, filters, limit).await;
        }

        // an empty projection (COUNT(*)) still needs whole rows
        let fields = projection
            .filter(|proj| !proj.is_empty())
            .map(|proj| projected_field_names(&self.schema, proj));
        let reader = PartitionedReader::new(
            self.store.clone(),
            self.config.read_source(),
            self.config.page_length,
        )
        .with_projection(fields)
        .with_selector(filter::to_selector(filters, &self.schema));

        // LIMIT is left to DataFusion: a page can hold fewer rows than its
        // range once design documents are dropped
        let partitions = reader.plan().await?;
        if partitions.is_empty() {
            let schema = match projection {
                Some(proj) => create_projected_schema(&self.schema, proj)?,
                None => self.schema.clone(),
            };
            return Ok(Arc::new(EmptyExec::new(schema)));
        }

        Ok(Arc::new(CouchExec::try_new(
            Arc::new(reader),
            partitions,
            self.schema.clone(),
            projection.cloned(),
        )?))
    }

    fn supports_filters_pushdown(
        &self,
        filters: &[&Expr],
    ) -> DataFusionResult<Vec<TableProviderFilterPushDown>> {
        let pushdown =
            self.dataset.is_none() && self.store.supports_pushdown(&self.config.read_source());
        Ok(filters
            .iter()
            .map(|f| {
                if pushdown && filter::is_translatable(f, &self.schema) {
                    TableProviderFilterPushDown::Inexact
                } else {
                    TableProviderFilterPushDown::Unsupported
                }
            })
            .collect())
    }

    async fn insert_into(
        &self,
        _state: &dyn Session,
        input: Arc<dyn ExecutionPlan>,
        insert_op: InsertOp,
    ) -> DataFusionResult<Arc<dyn ExecutionPlan>> {
        match insert_op {
            InsertOp::Append => {}
            InsertOp::Overwrite => warn_overwrite(&self.store),
            InsertOp::Replace => {
                return not_impl_err!("REPLACE INTO is not supported for CouchDB tables");
            }
        }

        Ok(Arc::new(DataSinkExec::new(
            input,
            Arc::new(CouchSink::new(self.writer())),
            self.schema.clone(),
            None,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SampleSize;
    use couchdb_store::{Document, MemoryStore};
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use datafusion::prelude::{col, lit};
    use serde_json::json;

    fn movies() -> Vec<Document> {
        vec![
            json!({"_id": "m1", "title": "Alien", "year": 1979}),
            json!({"_id": "m2", "title": "Heat", "year": 1995}),
            json!({"_id": "m3", "title": "Arrival", "year": 2016}),
        ]
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect()
    }

    fn config() -> CouchConfig {
        CouchConfig::new("http://localhost:5984", "movies")
    }

    #[tokio::test]
    async fn test_full_scan_materializes() {
        let store = Arc::new(MemoryStore::with_documents("movies", movies()));
        let table = CouchTable::try_new(store, config(), None).await.unwrap();

        assert!(table.is_materialized());
        assert!(table.schema().field_with_name("title").is_ok());
    }

    #[tokio::test]
    async fn test_sampled_table_reads_store_on_scan() {
        let store = Arc::new(MemoryStore::with_documents("movies", movies()));
        let mut cfg = config();
        cfg.schema_sample_size = SampleSize::Limit(2);
        let table = CouchTable::try_new(store, cfg, None).await.unwrap();

        assert!(!table.is_materialized());
        assert_eq!(table.store().database_url(), "memory://movies");
    }

    #[tokio::test]
    async fn test_filter_pushdown_only_with_query_source() {
        let schema = Arc::new(Schema::new(vec![Field::new("year", DataType::Int64, true)]));
        let store = Arc::new(MemoryStore::with_documents("movies", movies()));
        let filter = col("year").gt(lit(1990i64));
        let untranslatable = col("year").eq(col("year"));

        let table = CouchTable::try_new(store.clone(), config(), Some(schema.clone()))
            .await
            .unwrap();
        assert_eq!(
            table.supports_filters_pushdown(&[&filter]).unwrap(),
            vec![TableProviderFilterPushDown::Unsupported]
        );

        let mut cfg = config();
        cfg.use_query = true;
        let table = CouchTable::try_new(store, cfg, Some(schema)).await.unwrap();
        assert_eq!(
            table
                .supports_filters_pushdown(&[&filter, &untranslatable])
                .unwrap(),
            vec![
                TableProviderFilterPushDown::Inexact,
                TableProviderFilterPushDown::Unsupported
            ]
        );
    }

    #[tokio::test]
    async fn test_insert_overwrite_appends() {
        let store = Arc::new(MemoryStore::with_documents("movies", movies()));
        let schema = Arc::new(Schema::new(vec![Field::new("title", DataType::Utf8, true)]));
        let table = CouchTable::try_new(store.clone(), config(), Some(schema.clone()))
            .await
            .unwrap();

        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(datafusion::arrow::array::StringArray::from(vec!["Ran"]))],
        )
        .unwrap();
        let written = table.insert(vec![vec![batch]], true).await.unwrap();

        assert_eq!(written, 1);
        assert_eq!(store.documents().len(), 4);
    }

    #[tokio::test]
    async fn test_changes_stream_decodes_each_page() {
        let pages = vec![movies()[..2].to_vec(), movies()[2..].to_vec()];
        let store = Arc::new(MemoryStore::new("movies").with_change_pages(pages));
        let schema = Arc::new(Schema::new(vec![
            Field::new("title", DataType::Utf8, true),
            Field::new("year", DataType::Int64, true),
        ]));
        let table = CouchTable::try_new(store.clone(), config(), Some(schema.clone()))
            .await
            .unwrap();

        let batches: Vec<RecordBatch> = table.changes_stream().try_collect().await.unwrap();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 3);
        assert_eq!(batches[0].schema(), schema);
        assert_eq!(store.calls().poll, 3);
    }
}
