//! # ragline
//!
//! Hybrid retrieval-augmented-generation core: ingest raw text into a
//! scoped knowledge store, then serve ranked context that merges keyword
//! and embedding-similarity search.
//!
//! ## Architecture
//!
//! ```text
//!                ┌──────────────────────── TraceRecorder ◀──────────────────────┐
//!                │                         (ring buffer)                        │
//!                ▼                                                              │
//! SourceDocument ─▶ Chunker ─▶ EmbeddingGateway ─▶ Store ◀─┬─ keyword leg ──┐   │
//!                   (ingest pipeline, one state machine)   └─ semantic leg ─┴─▶ merge/rank/budget
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ragline init
//! ragline ingest ./notes --owner team-a
//! ragline embed pending
//! ragline search "deploy rollback" --owner team-a
//! ragline traces --hourly
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`cancel`] | Caller-supplied cancellation and deadlines |
//! | [`embedding`] | HTTP embedding providers |
//! | [`gateway`] | Batching, retry and failure isolation around a provider |
//! | [`ingest`] | Chunk → embed → store pipeline |
//! | [`retrieve`] | Concurrent hybrid retrieval |
//! | [`engine`] | `ingest` / `retrieve` / `recent_traces` facade |
//! | [`connector_fs`] | Filesystem scanning into source documents |
//! | [`sqlite_store`] | SQLite-backed store |
//! | [`trace_sink`] | Background batched trace persistence |
//! | [`stats`] | Hourly trace aggregation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema setup |
//!
//! Data models, the chunker, searchers and the trace recorder live in the
//! runtime-free `ragline-core` crate, re-exported here.

pub use ragline_core;

pub mod cancel;
pub mod config;
pub mod connector_fs;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod gateway;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod retrieve;
pub mod sqlite_store;
pub mod stats;
pub mod trace_sink;

pub use cancel::CancelToken;
pub use engine::Ragline;
