// ============================================================================
// memodocs Library
// ============================================================================
//
// A document store on top of a relational engine. Entities are serialized
// into one document table; map and reduce indexes are materialized into
// their own tables inside the same transaction that writes the documents.
//
// ============================================================================

//! # Example
//!
//! ```
//! use memodocs::{Column, DataType, Entity, IndexRecord, MapIndex, Store};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Article {
//!     title: String,
//!     tags: Vec<String>,
//! }
//!
//! impl Entity for Article {}
//!
//! #[derive(Serialize, Deserialize)]
//! struct ArticleTag {
//!     tag: String,
//! }
//!
//! impl IndexRecord for ArticleTag {
//!     fn columns() -> Vec<Column> {
//!         vec![Column::new("tag", DataType::Text)]
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let store = Store::in_memory()
//!     .register(MapIndex::<Article, ArticleTag>::new("ArticleTags").map(|a| {
//!         a.tags.iter().map(|t| ArticleTag { tag: t.clone() }).collect()
//!     }))
//!     .build()
//!     .await?;
//!
//! let mut session = store.create_session();
//! session.save(Article { title: "Hello".into(), tags: vec!["intro".into()] })?;
//! session.save_changes().await?;
//!
//! let mut session = store.create_session();
//! let tagged = session
//!     .query::<Article>()
//!     .with_index("ArticleTags")
//!     .filter("tag", memodocs::CompareOp::Eq, "intro")
//!     .list()
//!     .await?;
//! assert_eq!(tagged[0].read().title, "Hello");
//! # Ok::<(), memodocs::DbError>(())
//! # }).unwrap();
//! ```

pub mod core;
pub mod storage;
pub mod transaction;
pub mod connection;
pub mod dialect;
pub mod content;
pub mod document;
pub mod index;
pub mod command;
pub mod session;
pub mod store;

// Re-export main types for convenience
pub use core::{Column, DataType, DbError, Result, Row, TableSchema, Value};
pub use connection::{
    CompareOp, Connection, ConnectionFactory, InMemoryDB, IsolationLevel, Statement,
};
pub use content::{ContentSerializer, JsonContentSerializer};
pub use dialect::{Dialect, PostgresDialect, SqliteDialect};
pub use document::{DocHandle, DocumentId, Entity};
pub use index::{IndexDefinition, IndexRecord, MapIndex, ReduceIndex};
pub use session::{DocumentQuery, EntityState, FlushSummary, IndexQuery, Session};
pub use store::{Store, StoreBuilder, StoreConfig};
