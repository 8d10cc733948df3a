//! Per-key advisory locks for rebuild mutual exclusion.
//!
//! Scoped to a [`StalenessKey`], never global: rebuilds for different
//! persons (or different model/algorithm versions of the same person)
//! proceed independently.

use kindred_core::types::StalenessKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<StdMutex<HashMap<StalenessKey, Arc<AsyncMutex<()>>>>>,
}

impl KeyedLocks {
    fn handle(&self, key: &StalenessKey) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().expect("keyed lock map poisoned");
        map.entry(key.clone()).or_default().clone()
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &StalenessKey) -> OwnedMutexGuard<()> {
        self.handle(key).lock_owned().await
    }

    /// Like [`acquire`](Self::acquire), bounded. `None` when `timeout`
    /// elapses while another holder is mid-rebuild.
    pub async fn acquire_timeout(
        &self,
        key: &StalenessKey,
        timeout: Duration,
    ) -> Option<OwnedMutexGuard<()>> {
        tokio::time::timeout(timeout, self.handle(key).lock_owned())
            .await
            .ok()
    }
}
