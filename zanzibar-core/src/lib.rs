//! Zanzibar-style relationship-based authorization core
//!
//! This crate provides:
//! - Versioned namespace definitions with relation rewrite rules
//! - An MVCC tuple store with atomic, precondition-guarded batch writes
//! - Snapshot-consistent permission checks with concurrent set evaluation
//! - Subject expansion and an ordered change feed
//!
//! # Core Concepts
//!
//! - **Tuple**: `namespace:object#relation@subject`, where the subject is a user
//!   id or a userset `namespace:object#relation`
//! - **Namespace**: the relations of an object type and how each is computed
//! - **Revision**: a gapless, monotonically increasing commit number; every
//!   read is pinned to one
//!
//! # Example
//!
//! ```rust
//! use tokio_util::sync::CancellationToken;
//! use zanzibar_core::{
//!     AuthorizationEngine, CheckRequest, EngineConfig, Mutation, NamespaceDefinition,
//!     RelationDefinition, Rewrite,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = AuthorizationEngine::in_memory(EngineConfig::default())?;
//!
//!     engine
//!         .write_namespace(
//!             NamespaceDefinition::new("document")
//!                 .with_relation(RelationDefinition::direct("owner"))
//!                 .with_relation(RelationDefinition::rewritten(
//!                     "viewer",
//!                     Rewrite::union(vec![Rewrite::This, Rewrite::computed("owner")]),
//!                 )),
//!         )
//!         .await?;
//!
//!     engine
//!         .write_tuples(vec![Mutation::add("document:readme#owner@user:alice".parse()?)], vec![])
//!         .await?;
//!
//!     let response = engine
//!         .check_permission(
//!             CheckRequest::new("document:readme#viewer".parse()?, "user:alice".parse()?),
//!             &CancellationToken::new(),
//!         )
//!         .await?;
//!     assert!(response.allowed);
//!
//!     Ok(())
//! }
//! ```

pub mod check;
pub mod config;
pub mod engine;
pub mod error;
pub mod expand;
pub mod models;
pub mod repository;
pub mod schema;
pub mod watch;

pub use check::PermissionChecker;
pub use config::{CheckConfig, EngineConfig, WatchConfig};
pub use engine::*;
pub use error::*;
pub use expand::{ExpandNode, SubjectExpander};
pub use models::*;
pub use repository::{
    ChangeSet, InMemoryNamespaceStore, InMemoryTupleStore, NamespaceStore, RevisionClock,
    TupleStore, TupleStream,
};
pub use schema::*;
pub use watch::WatchFeed;
