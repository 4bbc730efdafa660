//! Client-side contract for a CouchDB-compatible document store.
//!
//! The [`DocumentStore`] trait captures the primitives the DataFusion
//! integration needs: counting, paginated range fetches, bulk saves,
//! database creation and long-poll change feeds. [`CouchClient`] speaks
//! the CouchDB HTTP API; [`MemoryStore`] keeps everything in process.

pub mod document;
pub mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod memory;
pub mod store;

pub use document::{is_design_document, ChangePage, Document, FeedCursor, SaveOutcome};
pub use error::{Error, Result};
#[cfg(feature = "http")]
pub use http::CouchClient;
pub use memory::{MemoryStore, StoreCalls};
pub use store::{ChangeFeed, DocumentStore, FeedOptions, FetchRequest, ReadSource};
