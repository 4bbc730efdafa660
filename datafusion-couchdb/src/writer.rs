//! Partitioned writes through bulk saves
//!
//! Each partition is saved independently and concurrently. There is no
//! rollback: partitions that succeeded before another failed stay written.

use couchdb_store::{DocumentStore, SaveOutcome};
use datafusion::arrow::array::RecordBatch;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::convert::batches_to_documents;
use crate::error::{Error, Result};

/// Result of saving one partition
#[derive(Debug)]
pub struct PartitionWriteOutcome {
    pub partition: usize,
    pub rows: usize,
    /// Documents saved, or why the partition failed
    pub result: Result<usize>,
}

impl PartitionWriteOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-partition outcomes of one write
#[derive(Debug, Default)]
pub struct WriteReport {
    pub outcomes: Vec<PartitionWriteOutcome>,
}

impl WriteReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(PartitionWriteOutcome::is_ok)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &PartitionWriteOutcome> {
        self.outcomes.iter().filter(|o| o.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &PartitionWriteOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }

    pub fn documents_saved(&self) -> u64 {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .map(|&saved| saved as u64)
            .sum()
    }

    /// Number of documents saved, or [`Error::PartialWrite`] if any
    /// partition failed
    pub fn into_result(self) -> Result<u64> {
        if self.is_success() {
            Ok(self.documents_saved())
        } else {
            Err(Error::PartialWrite(self))
        }
    }
}

impl fmt::Display for WriteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed: Vec<String> = self
            .failed()
            .filter_map(|o| match &o.result {
                Err(e) => Some(format!("partition {}: {}", o.partition, e)),
                Ok(_) => None,
            })
            .collect();
        let succeeded: Vec<String> = self.succeeded().map(|o| o.partition.to_string()).collect();
        write!(
            f,
            "{} of {} partitions failed ({}); succeeded partitions: [{}]",
            failed.len(),
            self.outcomes.len(),
            failed.join("; "),
            succeeded.join(", ")
        )
    }
}

#[derive(Debug, Clone)]
pub struct PartitionedWriter {
    store: Arc<dyn DocumentStore>,
    bulk_size: usize,
    create_db_on_save: bool,
}

impl PartitionedWriter {
    pub fn new(store: Arc<dyn DocumentStore>, bulk_size: usize, create_db_on_save: bool) -> Self {
        Self {
            store,
            bulk_size: bulk_size.max(1),
            create_db_on_save,
        }
    }

    pub fn database_url(&self) -> String {
        self.store.database_url()
    }

    /// Save every partition; one inner vector per partition.
    ///
    /// Input without rows makes no store call at all. A failure to create
    /// the database aborts before any partition is saved; partition
    /// failures are reported in the returned [`WriteReport`].
    pub async fn write(&self, partitions: Vec<Vec<RecordBatch>>) -> Result<WriteReport> {
        let total_rows: usize = partitions.iter().flatten().map(RecordBatch::num_rows).sum();
        if total_rows == 0 {
            warn!(
                database = %self.store.database_url(),
                "Database was not saved because the number of records was 0"
            );
            return Ok(WriteReport::default());
        }

        if self.create_db_on_save {
            self.store
                .create_database_if_absent()
                .await
                .map_err(|e| Error::store_access("create database", e))?;
        }

        let partition_count = partitions.len();
        let outcomes = join_all(
            partitions
                .into_iter()
                .enumerate()
                .map(|(index, batches)| self.write_partition(index, batches)),
        )
        .await;
        let report = WriteReport { outcomes };

        info!(
            database = %self.store.database_url(),
            partitions = partition_count,
            rows = total_rows,
            saved = report.documents_saved(),
            failed = report.failed().count(),
            "Finished bulk save"
        );
        Ok(report)
    }

    async fn write_partition(&self, partition: usize, batches: Vec<RecordBatch>) -> PartitionWriteOutcome {
        let rows: usize = batches.iter().map(RecordBatch::num_rows).sum();
        let result = if rows == 0 {
            Ok(0)
        } else {
            self.save_partition(partition, &batches).await
        };
        if let Err(e) = &result {
            warn!(partition, rows, error = %e, "Partition save failed");
        }
        PartitionWriteOutcome {
            partition,
            rows,
            result,
        }
    }

    async fn save_partition(&self, partition: usize, batches: &[RecordBatch]) -> Result<usize> {
        let documents = batches_to_documents(batches)?;
        let mut saved = 0;
        let mut rejected: Vec<SaveOutcome> = Vec::new();

        for (chunk_index, chunk) in documents.chunks(self.bulk_size).enumerate() {
            let outcomes = self.store.bulk_save(chunk).await.map_err(|e| {
                Error::store_access(format!("partition {} bulk {}", partition, chunk_index), e)
            })?;
            for outcome in outcomes {
                if outcome.is_ok() {
                    saved += 1;
                } else {
                    rejected.push(outcome);
                }
            }
            debug!(partition, chunk = chunk_index, docs = chunk.len(), "Saved bulk chunk");
        }

        if rejected.is_empty() {
            Ok(saved)
        } else {
            Err(Error::Rejected {
                scope: format!("partition {}", partition),
                rejected,
            })
        }
    }
}
