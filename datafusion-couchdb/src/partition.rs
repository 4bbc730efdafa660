//! Partitioned reads over a paginated listing
//!
//! One count query sizes the listing, which is then cut into contiguous
//! `[offset, offset + page_length)` ranges fetched independently. Rows
//! written between the count and the fetches may be missed or read twice;
//! the partition set is a best-effort snapshot.

use couchdb_store::{Document, DocumentStore, FetchRequest, ReadSource};
use futures::future::try_join_all;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// One contiguous slice of a listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub index: usize,
    pub offset: u64,
    pub limit: u64,
}

impl PartitionDescriptor {
    pub fn end(&self) -> u64 {
        self.offset + self.limit
    }
}

impl fmt::Display for PartitionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition {} [{}, {})", self.index, self.offset, self.end())
    }
}

/// Cut `[0, total)` into `ceil(total / page_length)` contiguous ranges.
///
/// The last range ends exactly at `total`.
pub fn plan_partitions(total: u64, page_length: u64) -> Vec<PartitionDescriptor> {
    let page_length = page_length.max(1);
    (0..total.div_ceil(page_length))
        .map(|i| {
            let offset = i * page_length;
            PartitionDescriptor {
                index: i as usize,
                offset,
                limit: page_length.min(total - offset),
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct PartitionedReader {
    store: Arc<dyn DocumentStore>,
    source: ReadSource,
    page_length: u64,
    fields: Option<Vec<String>>,
    selector: Option<Value>,
}

impl PartitionedReader {
    pub fn new(store: Arc<dyn DocumentStore>, source: ReadSource, page_length: u64) -> Self {
        Self {
            store,
            source,
            page_length,
            fields: None,
            selector: None,
        }
    }

    /// Fields to request; dropped when the source cannot project
    pub fn with_projection(mut self, fields: Option<Vec<String>>) -> Self {
        self.fields = fields.filter(|_| self.pushdown_enabled());
        self
    }

    /// Mango selector to request; dropped when the source cannot filter
    pub fn with_selector(mut self, selector: Option<Value>) -> Self {
        self.selector = selector.filter(|_| self.pushdown_enabled());
        self
    }

    pub fn pushdown_enabled(&self) -> bool {
        self.store.supports_pushdown(&self.source)
    }

    pub fn source(&self) -> &ReadSource {
        &self.source
    }

    pub fn selector(&self) -> Option<&Value> {
        self.selector.as_ref()
    }

    pub async fn count(&self) -> Result<u64> {
        self.store
            .count_documents(&self.source)
            .await
            .map_err(|e| Error::store_access(format!("count {}", self.source), e))
    }

    /// Issue the count query and plan partitions from it
    pub async fn plan(&self) -> Result<Vec<PartitionDescriptor>> {
        let total = self.count().await?;
        let partitions = plan_partitions(total, self.page_length);
        info!(
            database = %self.store.database_url(),
            source = %self.source,
            total,
            page_length = self.page_length,
            partitions = partitions.len(),
            "Planned read partitions"
        );
        Ok(partitions)
    }

    pub async fn fetch_partition(&self, partition: &PartitionDescriptor) -> Result<Vec<Document>> {
        let request = FetchRequest::new(self.source.clone(), partition.offset, partition.limit)
            .with_fields(self.fields.clone())
            .with_selector(self.selector.clone());

        let documents = self
            .store
            .fetch_range(&request)
            .await
            .map_err(|e| Error::store_access(partition.to_string(), e))?;
        debug!(
            partition = partition.index,
            offset = partition.offset,
            rows = documents.len(),
            "Fetched partition"
        );
        Ok(documents)
    }

    /// Fetch every partition concurrently, in partition order
    pub async fn fetch_all(&self) -> Result<Vec<Vec<Document>>> {
        let partitions = self.plan().await?;
        try_join_all(partitions.iter().map(|p| self.fetch_partition(p))).await
    }
}
