//! Per-instance read caches.

use std::future::Future;
use tokio::sync::Mutex;

use crate::Result;

/// Memoizes one remote read until explicitly invalidated.
///
/// Owners call [`ReadCache::invalidate`] after every mutating call so the next
/// read observes the new remote state.
#[derive(Debug)]
pub struct ReadCache<T> {
    slot: Mutex<Option<T>>,
}

impl<T> Default for ReadCache<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T: Clone + Send> ReadCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value, loading it with `load` on a miss.
    pub async fn get_or_try_load<F, Fut>(&self, load: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(value) = slot.as_ref() {
            return Ok(value.clone());
        }
        let value = load().await?;
        *slot = Some(value.clone());
        Ok(value)
    }

    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }

    pub async fn is_cached(&self) -> bool {
        self.slot.lock().await.is_some()
    }
}
