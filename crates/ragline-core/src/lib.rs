//! # ragline core
//!
//! Runtime-free logic for ragline: data models, chunking, the store
//! abstraction, keyword/semantic scoring with hybrid merging, the ingestion
//! state machine, and the bounded trace recorder.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. The application
//! crate drives these pieces from an async runtime and supplies concrete
//! embedding providers and storage backends.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Source documents, chunks, embeddings, scopes, retrieval results |
//! | [`chunk`] | Overlapping passage splitter with a filtering policy |
//! | [`embedding`] | `Embedder` trait, embedding errors, vector helpers |
//! | [`lifecycle`] | Per-document ingestion state machine |
//! | [`search`] | Keyword scoring, semantic ranking, hybrid merge, budgets |
//! | [`store`] | `Store` trait and the in-memory implementation |
//! | [`trace`] | Trace events and the fixed-capacity recorder |
//! | [`error`] | Error taxonomy shared by every stage |

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod search;
pub mod store;
pub mod trace;

pub use error::{Error, Result};
