//! # gofi
//!
//! Collects file-inventory snapshots produced on many client machines and
//! merges them into one deduplicated, queryable catalog.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  TCP :1985  ┌──────────┐   ┌───────┐   ┌─────────┐
//! │  client  │────────────▶│ transfer │──▶│ codec │──▶│  merge  │
//! │ scan+send│             └──────────┘   └───────┘   └────┬────┘
//! └──────────┘  UDP :1985  ┌───────────┐                   ▼
//!       └─────────────────▶│ datagram  │─────────────▶┌─────────┐
//!                          └───────────┘              │ catalog │
//!                                 HTTP GET / ────────▶│ (SQLite)│
//!                                 (query engine)      └─────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! gofi init                                   # create the catalog
//! gofi serve                                  # run receivers + HTTP view
//! gofi scan ~/ --out home.db --machine ana --ip 10.0.0.2
//! gofi send home.db --addr collector:1985
//! gofi query --param filetype=pdf
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | The [`Record`](models::Record) type |
//! | [`transfer`] | Fixed-header stream protocol (receive and send) |
//! | [`codec`] | Snapshot decoding/encoding (SQLite file or JSON list) |
//! | [`merge`] | Transactional insert-or-ignore merge |
//! | [`store`] | Catalog handle |
//! | [`query`] | Sanitized filter/sort/limit queries and facets |
//! | [`collector`] | Stream and datagram listeners |
//! | [`server`] | HTTP server and process wiring |
//! | [`scan`] | Client-side snapshot builder |
//! | [`stats`] | Catalog statistics |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod codec;
pub mod collector;
pub mod config;
pub mod db;
pub mod error;
pub mod merge;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod query;
pub mod scan;
pub mod server;
pub mod stats;
pub mod store;
pub mod transfer;
