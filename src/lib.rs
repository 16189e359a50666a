//! Docstore – a document-store layer over a relational engine.
//!
//! Callers describe what they want with nested JSON: a recursive boolean
//! predicate DSL plus a set of search *traits* (fields, ordering, grouping,
//! paging). The crate compiles those into parameterized SQL, runs them inside
//! a managed transaction, and hands back identity-aware document graphs.
//!
//! * A *record kind* ([`record::RecordKind`]) is a table with reserved columns
//!   and one free-form JSON payload flattened onto the record when loaded.
//! * A [`predicate::Predicate`] is an SQL fragment with its ordered parameters.
//! * A [`query::Query`] accumulates predicates and renders one statement.
//! * An [`graph::ObjectGraph`] deduplicates repeated entities by `id`.
//! * A [`session::Session`] owns one transaction, a result queue, an
//!   inactivity watchdog and the change-event router.
//!
//! ## Modules
//! * [`predicate`] – DSL to SQL fragments, including `BIND` calls into an
//!   external evaluator and related-document expansion.
//! * [`query`] – statement assembly, placeholder renumbering, row decoding.
//! * [`graph`] – scan / merge / expand / compact over an arena.
//! * [`event`] – event identifiers, notification payloads, subscriptions.
//! * [`persist`] – the storage, migration and evaluator collaborators, and a
//!   SQLite implementation of them.
//! * [`session`] – the transaction state machine and every record operation.
//! * [`config`] – explicit session configuration and tracing setup.
//!
//! ## Quick Start
//! ```
//! use docstore::graph::compact_value;
//! use serde_json::json;
//! let user = json!({"id": "u1", "name": "Ada"});
//! let doc = json!({"id": "d1", "owner": user, "editor": {"id": "u1", "mail": "a@b"}});
//! let compacted = compact_value(&doc).unwrap();
//! assert_eq!(compacted["$refs"]["u1"]["mail"], json!("a@b"));
//! ```
//!
//! Sessions need a tokio runtime and a [`persist::Storage`]; the bundled
//! [`persist::SqlitePersistor`] creates its own schema:
//! ```
//! # async fn demo() -> docstore::Result<()> {
//! use docstore::{config::SessionConfig, persist::SqlitePersistor, predicate::Dialect, session::Session};
//! let config = SessionConfig::default().with_dialect(Dialect::Sqlite);
//! let session = Session::start(Box::new(SqlitePersistor::in_memory()?), config).await?;
//! session.create_document("User", serde_json::json!({"name": "Ada"})).await?;
//! session.commit().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod persist;
pub mod predicate;
pub mod query;
pub mod record;
pub mod session;

pub use error::{DocstoreError, Result};
