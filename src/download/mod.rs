//! Download pipeline: task model, shared queue, worker pool, the media
//! routine, the custom-download manager and the ZIP packager.

pub mod custom;
pub mod media;
pub mod notifier;
pub mod queue;
pub mod task;
pub mod uploader;
pub mod worker;
pub mod zip;

pub use queue::DownloadQueue;
pub use task::{DownloadStatus, TaskNode, TaskRegistry};
