//! # Custody Vault
//!
//! An OCR ingestion pipeline with an append-only, verifiable chain of
//! custody.
//!
//! Custody Vault accepts a document reference (URL or local path), fetches
//! it, renders it to page images, runs OCR on every page, assembles the
//! page text, and commits it to a full-text index. Every transition is
//! recorded in a hash-chained provenance ledger, so the state of any
//! document can be re-derived, audited, and resumed after a crash.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐  ┌───────────┐  ┌───────┐  ┌──────────┐  ┌─────────┐
//! │ Fetcher │─▶│ Converter │─▶│  OCR  │─▶│ Assemble │─▶│ Indexer │
//! └────┬────┘  └─────┬─────┘  └───┬───┘  └────┬─────┘  └────┬────┘
//!      │             │            │           │             │
//!      ▼             ▼            ▼           ▼             ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Content Store (objects/)   ·   Provenance Ledger (SQLite)   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`pipeline`] orchestrator owns the state machine; each component
//! stores its artifacts by content hash and appends its own ledger event.
//!
//! ## Quick Start
//!
//! ```bash
//! vault init
//! vault ingest https://example.org/report.pdf
//! vault search "appropriations"
//! vault history doc-3f2a9c01b4d7e865
//! vault verify
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`content_store`] | Content-addressed artifact storage |
//! | [`ledger`] | Hash-chained provenance ledger and custody fold |
//! | [`fetch`] | Source retrieval over HTTP or the local filesystem |
//! | [`convert`] | Rendering documents to page images |
//! | [`ocr`] | Page text recognition |
//! | [`assemble`] | Page text assembly with offsets |
//! | [`indexer`] | Full-text index commits |
//! | [`search`] | Page-level keyword search |
//! | [`pipeline`] | Orchestrator and worker pool |
//! | [`lease`] | Per-document exclusive leases |
//! | [`retry`] | Backoff with jitter |
//! | [`progress`] | Stderr progress reporting |
//! | [`get`] | Custody history and document views |
//! | [`stats`] | Status counts and vault verification |
//! | [`export`] | Ledger export as JSON Lines |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod assemble;
pub mod config;
pub mod content_store;
pub mod convert;
pub mod db;
pub mod error;
pub mod export;
pub mod fetch;
pub mod get;
pub mod indexer;
pub mod lease;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod ocr;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod search;
pub mod stats;
