//! The process-wide runtime value.
//!
//! All previously-global mutable state (queue, registries, progress map,
//! broker) lives here; handlers and workers receive an `Arc<Runtime>`.
//! Constructed once at startup, torn down on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::client::broker::ClientBroker;
use crate::core::settings::Settings;
use crate::download::queue::DownloadQueue;
use crate::download::task::TaskRegistry;
use crate::download::uploader::Uploader;
use crate::download::zip::ZipRegistry;
use crate::progress::DownloadTracker;
use crate::storage::db::DbPool;

pub struct Runtime {
    pub db: Arc<DbPool>,
    pub settings: Settings,
    pub queue: Arc<DownloadQueue>,
    pub tracker: Arc<DownloadTracker>,
    pub tasks: Arc<TaskRegistry>,
    pub broker: Arc<ClientBroker>,
    pub zips: Arc<ZipRegistry>,
    pub uploader: Option<Arc<dyn Uploader>>,
    is_running: AtomicBool,
}

impl Runtime {
    pub fn new(db: Arc<DbPool>, settings: Settings, broker: Arc<ClientBroker>) -> Arc<Self> {
        Arc::new(Self {
            db,
            settings,
            queue: Arc::new(DownloadQueue::new()),
            tracker: Arc::new(DownloadTracker::new()),
            tasks: Arc::new(TaskRegistry::new()),
            broker,
            zips: Arc::new(ZipRegistry::new()),
            uploader: None,
            is_running: AtomicBool::new(true),
        })
    }

    pub fn with_uploader(db: Arc<DbPool>, settings: Settings, broker: Arc<ClientBroker>, uploader: Arc<dyn Uploader>) -> Arc<Self> {
        Arc::new(Self {
            db,
            settings,
            queue: Arc::new(DownloadQueue::new()),
            tracker: Arc::new(DownloadTracker::new()),
            tasks: Arc::new(TaskRegistry::new()),
            broker,
            zips: Arc::new(ZipRegistry::new()),
            uploader: Some(uploader),
            is_running: AtomicBool::new(true),
        })
    }

    /// True while workers should keep draining the queue.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Begins shutdown: workers exit after their current message.
    pub fn shutdown(&self) {
        log::info!("Shutdown requested");
        self.is_running.store(false, Ordering::SeqCst);
        self.tasks.stop_all();
    }
}
