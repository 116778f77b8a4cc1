//! tgdl — Telegram media download engine.
//!
//! This library provides the core of the downloader: the persistent state
//! layer, the upstream client broker, the bounded worker pool with its shared
//! queue, the per-job task model, the ZIP packaging pipeline and the HTTP
//! control surface.
//!
//! # Module Structure
//!
//! - `core`: configuration, errors, logging, the shared `Runtime`
//! - `storage`: SQLite pool, migrations and one repository per entity
//! - `client`: normalized upstream types, the `UpstreamClient` port and the
//!   per-user session broker
//! - `progress`: in-memory per-file progress and the global run state
//! - `download`: task model, queue, workers, media routine, custom-download
//!   manager and ZIP packager
//! - `web`: axum control surface

pub mod client;
pub mod core;
pub mod download;
pub mod progress;
pub mod storage;
pub mod web;

// Re-export commonly used types for convenience
pub use crate::core::{config, error::AppError, error::AppResult, runtime::Runtime};
pub use download::{queue::DownloadQueue, task::TaskNode, task::TaskRegistry};
pub use progress::{DownloadState, DownloadTracker};
pub use storage::db::{create_pool, get_connection, DbConnection, DbPool};
