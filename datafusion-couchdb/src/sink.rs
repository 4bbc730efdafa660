use async_trait::async_trait;
use datafusion::error::Result as DataFusionResult;
use datafusion::execution::{SendableRecordBatchStream, TaskContext};
use datafusion::physical_plan::insert::DataSink;
use datafusion::physical_plan::metrics::MetricsSet;
use datafusion::physical_plan::{DisplayAs, DisplayFormatType};
use futures::StreamExt;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::writer::PartitionedWriter;

/// `INSERT INTO` target; every incoming record batch is saved as its own
/// write partition
#[derive(Debug)]
pub struct CouchSink {
    writer: PartitionedWriter,
}

impl CouchSink {
    pub fn new(writer: PartitionedWriter) -> Self {
        Self { writer }
    }
}

impl DisplayAs for CouchSink {
    fn fmt_as(&self, _t: DisplayFormatType, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CouchSink: database={}", self.writer.database_url())
    }
}

#[async_trait]
impl DataSink for CouchSink {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn metrics(&self) -> Option<MetricsSet> {
        None
    }

    async fn write_all(
        &self,
        mut data: SendableRecordBatchStream,
        _context: &Arc<TaskContext>,
    ) -> DataFusionResult<u64> {
        let mut partitions = Vec::new();
        while let Some(batch) = data.next().await {
            partitions.push(vec![batch?]);
        }

        let report = self.writer.write(partitions).await?;
        Ok(report.into_result()?)
    }
}
