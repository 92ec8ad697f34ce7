use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per target: creations and restores of the same target are
/// serialized, different targets proceed in parallel.
#[derive(Default)]
pub struct TargetLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TargetLocks {
    pub async fn lock(&self, target_id: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(target_id.to_owned()).or_default())
        };
        mutex.lock_owned().await
    }
}
