use crate::error::Result;
use crate::storage::engine::EngineHandle;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Keeps at most one open `EngineHandle` per data file. Leases are `Arc`
/// clones; a handle is closed when it has been evicted and its last lease drops.
#[derive(Default)]
pub struct HandlePool {
    handles: Mutex<Handles>,
}

#[derive(Default)]
struct Handles {
    open: HashMap<PathBuf, Arc<EngineHandle>>,
    /// Evicted while still leased. Reused by `acquire` until the last lease drops.
    evicted: HashMap<PathBuf, Weak<EngineHandle>>,
}

impl HandlePool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Handles> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn acquire(&self, path: &Path) -> Result<Arc<EngineHandle>> {
        let mut handles = self.lock();
        if let Some(handle) = handles.open.get(path) {
            return Ok(handle.clone());
        }

        let handle = match handles.evicted.remove(path).and_then(|weak| weak.upgrade()) {
            Some(handle) => handle,
            // Opened under the pool lock so two callers never open the same file.
            None => Arc::new(EngineHandle::open_or_create(path)?),
        };
        handles.open.insert(path.to_path_buf(), handle.clone());
        Ok(handle)
    }

    /// Close handles nobody is currently using. Returns how many were closed.
    pub fn release_idle(&self) -> usize {
        let mut handles = self.lock();
        let before = handles.open.len();
        handles.open.retain(|_, handle| Arc::strong_count(handle) > 1);
        handles.evicted.retain(|_, weak| weak.strong_count() > 0);
        before - handles.open.len()
    }

    pub fn open_handles(&self) -> usize {
        self.lock().open.len()
    }

    /// Evict every handle. Handles still leased close once their leases drop.
    pub fn close_all(&self) -> usize {
        let mut handles = self.lock();
        let count = handles.open.len();
        let Handles { open, evicted } = &mut *handles;
        for (path, handle) in open.drain() {
            if Arc::strong_count(&handle) > 1 {
                evicted.insert(path, Arc::downgrade(&handle));
            }
        }
        evicted.retain(|_, weak| weak.strong_count() > 0);
        tracing::info!("Closed {} engine handles", count);
        count
    }
}
