use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::error::{DataFusionError, Result as DataFusionResult};
use datafusion::execution::{SendableRecordBatchStream, TaskContext};
use datafusion::physical_expr::EquivalenceProperties;
use datafusion::physical_plan::execution_plan::{Boundedness, EmissionType};
use datafusion::physical_plan::stream::RecordBatchStreamAdapter;
use datafusion::physical_plan::{
    DisplayAs, DisplayFormatType, ExecutionPlan, Partitioning, PlanProperties,
};
use futures::stream::{self, TryStreamExt};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::convert::documents_to_batches;
use crate::error::{Error, Result};
use crate::partition::{PartitionDescriptor, PartitionedReader};
use crate::schema::create_projected_schema;

/// Execution plan reading a CouchDB listing, one DataFusion partition per
/// page range
///
/// Nothing is fetched until a partition stream is first polled.
#[derive(Debug)]
pub struct CouchExec {
    reader: Arc<PartitionedReader>,
    partitions: Vec<PartitionDescriptor>,
    /// Full table schema documents are decoded with
    table_schema: SchemaRef,
    projection: Option<Vec<usize>>,
    schema: SchemaRef,
    plan_properties: PlanProperties,
}

impl CouchExec {
    pub fn try_new(
        reader: Arc<PartitionedReader>,
        partitions: Vec<PartitionDescriptor>,
        table_schema: SchemaRef,
        projection: Option<Vec<usize>>,
    ) -> Result<Self> {
        let schema = match &projection {
            Some(proj) => create_projected_schema(&table_schema, proj)?,
            None => table_schema.clone(),
        };

        let plan_properties = PlanProperties::new(
            EquivalenceProperties::new(schema.clone()),
            Partitioning::UnknownPartitioning(partitions.len()),
            EmissionType::Incremental,
            Boundedness::Bounded,
        );

        Ok(Self {
            reader,
            partitions,
            table_schema,
            projection,
            schema,
            plan_properties,
        })
    }

    pub fn partitions(&self) -> &[PartitionDescriptor] {
        &self.partitions
    }

    async fn read_partition(
        reader: Arc<PartitionedReader>,
        partition: PartitionDescriptor,
        table_schema: SchemaRef,
        projection: Option<Vec<usize>>,
    ) -> Result<Vec<RecordBatch>> {
        let documents = reader.fetch_partition(&partition).await?;
        let batches = documents_to_batches(&documents, &table_schema)?;
        match projection {
            Some(proj) => Ok(batches
                .iter()
                .map(|batch| batch.project(&proj))
                .collect::<std::result::Result<Vec<_>, _>>()?),
            None => Ok(batches),
        }
    }
}

impl DisplayAs for CouchExec {
    fn fmt_as(&self, t: DisplayFormatType, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "CouchExec: source={}, partitions={}",
            self.reader.source(),
            self.partitions.len()
        )?;
        if let (DisplayFormatType::Verbose, Some(selector)) = (t, self.reader.selector()) {
            write!(f, ", selector={}", selector)?;
        }
        Ok(())
    }
}

impl ExecutionPlan for CouchExec {
    fn name(&self) -> &str {
        "CouchExec"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn properties(&self) -> &PlanProperties {
        &self.plan_properties
    }

    fn children(&self) -> Vec<&Arc<dyn ExecutionPlan>> {
        vec![]
    }

    fn with_new_children(
        self: Arc<Self>,
        _children: Vec<Arc<dyn ExecutionPlan>>,
    ) -> DataFusionResult<Arc<dyn ExecutionPlan>> {
        Ok(self)
    }

    fn execute(
        &self,
        partition: usize,
        _context: Arc<TaskContext>,
    ) -> DataFusionResult<SendableRecordBatchStream> {
        let descriptor = *self.partitions.get(partition).ok_or_else(|| {
            DataFusionError::Execution(format!(
                "Partition {} out of range (have {} partitions)",
                partition,
                self.partitions.len()
            ))
        })?;

        let fetch = Self::read_partition(
            self.reader.clone(),
            descriptor,
            self.table_schema.clone(),
            self.projection.clone(),
        );
        let batches = stream::once(fetch)
            .map_ok(|batches| stream::iter(batches.into_iter().map(Ok::<_, Error>)))
            .try_flatten()
            .map_err(DataFusionError::from);

        Ok(Box::pin(RecordBatchStreamAdapter::new(
            self.schema.clone(),
            batches,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::infer_schema;
    use couchdb_store::{Document, MemoryStore, ReadSource};
    use datafusion::prelude::SessionContext;
    use futures::StreamExt;
    use serde_json::json;

    fn movies(n: usize) -> Vec<Document> {
        (0..n)
            .map(|i| json!({"_id": format!("m{:03}", i), "title": format!("Movie {}", i), "year": 1990 + i}))
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_execute_is_lazy_and_projects() {
        let docs = movies(5);
        let schema = infer_schema(&docs);
        let store = Arc::new(MemoryStore::with_documents("movies", docs));
        let reader = Arc::new(PartitionedReader::new(store.clone(), ReadSource::AllDocs, 2));
        let partitions = reader.plan().await.unwrap();

        let year = schema.index_of("year").unwrap();
        let exec = CouchExec::try_new(reader, partitions, schema, Some(vec![year])).unwrap();
        assert_eq!(exec.properties().output_partitioning().partition_count(), 3);
        assert_eq!(exec.schema().fields().len(), 1);

        let task_ctx = SessionContext::new().task_ctx();
        let mut stream = exec.execute(2, task_ctx).unwrap();
        assert_eq!(store.calls().fetch, 0);

        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.num_rows(), 1);
        assert_eq!(batch.schema().field(0).name(), "year");
        assert!(stream.next().await.is_none());
        assert_eq!(store.calls().fetch, 1);
    }

    #[tokio::test]
    async fn test_execute_out_of_range_partition() {
        let store = Arc::new(MemoryStore::new("movies"));
        let reader = Arc::new(PartitionedReader::new(store, ReadSource::AllDocs, 2));
        let schema = infer_schema(&movies(1));
        let exec = CouchExec::try_new(reader, vec![], schema, None).unwrap();

        assert!(exec.execute(0, SessionContext::new().task_ctx()).is_err());
    }

    #[tokio::test]
    async fn test_fetch_failure_surfaces_in_stream() {
        let docs = movies(4);
        let schema = infer_schema(&docs);
        let store = Arc::new(MemoryStore::with_documents("movies", docs).fail_fetch_at(2));
        let reader = Arc::new(PartitionedReader::new(store, ReadSource::AllDocs, 2));
        let partitions = reader.plan().await.unwrap();
        let exec = CouchExec::try_new(reader, partitions, schema, None).unwrap();

        let mut stream = exec.execute(1, SessionContext::new().task_ctx()).unwrap();
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("partition 1 [2, 4)"));
    }
}
