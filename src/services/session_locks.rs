//! Per-session mutual exclusion.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per upload id, so appends to the same blob never interleave
/// while different sessions proceed in parallel.
#[derive(Clone, Default)]
pub struct SessionLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl SessionLocks {
    /// Wait for exclusive access to `upload_id`.
    pub async fn acquire(&self, upload_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // Entries only the map references are idle.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(upload_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or_default()
    }
}
