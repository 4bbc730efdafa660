// DataFusion integration for CouchDB-compatible document stores

pub mod config;
pub mod convert;
pub mod error;
pub mod exec;
pub mod factory;
pub mod filter;
pub mod partition;
pub mod receiver;
pub mod resolver;
pub mod schema;
pub mod sink;
pub mod table;
pub mod writer;

pub use config::{CouchConfig, Endpoint, FeedMode, SampleSize};
pub use error::{Error, Result};
pub use factory::CouchTableFactory;
pub use receiver::{ChangeBatch, ChangeFeedReceiver, ReceiverHandle, ReceiverState};
pub use resolver::{ResolvedSchema, SchemaAcquisition, SchemaResolver};
pub use table::CouchTable;
pub use writer::{PartitionWriteOutcome, WriteReport};
