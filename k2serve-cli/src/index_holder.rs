//! Lifecycle of the shared, immutable classification index.
//!
//! The index starts loading in the background when the server boots and
//! moves through exactly one of two one-way transitions:
//! `Loading -> Ready` or `Loading -> Broken`. Every RPC consults the
//! holder; streams are admitted only against a `Ready` index.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use k2serve_core::Index;
use parking_lot::RwLock;
use tonic::Status;
use tracing::{error, info};

enum IndexState {
    Loading,
    Ready(Arc<Index>),
    Broken(String),
}

/// Owner of the index state machine.
pub struct IndexHolder {
    state: RwLock<IndexState>,
}

impl Default for IndexHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexHolder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexState::Loading),
        }
    }

    /// Spawn the background loader thread. An optional warm-up delay lets
    /// operators stage database files after starting the process.
    pub fn spawn_load(self: &Arc<Self>, db_path: PathBuf, memory_mapping: bool, wait_secs: u64) {
        let holder = Arc::clone(self);
        std::thread::Builder::new()
            .name("index-loader".to_string())
            .spawn(move || {
                if wait_secs > 0 {
                    info!(wait_secs, "delaying database load");
                    std::thread::sleep(Duration::from_secs(wait_secs));
                }
                info!(db = %db_path.display(), "loading database");
                match Index::open(&db_path, memory_mapping) {
                    Ok(index) => {
                        *holder.state.write() = IndexState::Ready(Arc::new(index));
                        info!("database ready");
                    }
                    Err(e) => {
                        error!(error = %e, "database load failed; server will remain unavailable");
                        *holder.state.write() = IndexState::Broken(e.to_string());
                    }
                }
            })
            .expect("spawning the index loader thread");
    }

    /// Install an already-built index; used by tests.
    pub fn set_ready(&self, index: Arc<Index>) {
        *self.state.write() = IndexState::Ready(index);
    }

    #[must_use]
    pub fn ready(&self) -> bool {
        matches!(&*self.state.read(), IndexState::Ready(_))
    }

    #[must_use]
    pub fn broken(&self) -> bool {
        matches!(&*self.state.read(), IndexState::Broken(_))
    }

    /// The index, if ready.
    #[must_use]
    pub fn get(&self) -> Option<Arc<Index>> {
        match &*self.state.read() {
            IndexState::Ready(index) => Some(Arc::clone(index)),
            _ => None,
        }
    }

    /// Admission check for RPCs: the index, or the status a caller
    /// should see instead.
    ///
    /// # Errors
    ///
    /// `Unavailable` while loading, `FailedPrecondition` once broken.
    pub fn gate(&self) -> Result<Arc<Index>, Status> {
        match &*self.state.read() {
            IndexState::Ready(index) => Ok(Arc::clone(index)),
            IndexState::Loading => Err(Status::unavailable(
                "index not loaded yet, please wait",
            )),
            IndexState::Broken(reason) => Err(Status::failed_precondition(format!(
                "index failed to load ({reason}); operator intervention required"
            ))),
        }
    }
}
