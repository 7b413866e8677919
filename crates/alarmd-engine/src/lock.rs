use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// In-process keyed mutex.
///
/// Upserts hold the guard for a fingerprint across their whole transaction,
/// and sweeps hold the guard for an alert's fingerprint while they
/// re-check and transition it. This serializes writers inside one process
/// even on backends without row locks, and covers the window where no
/// alert row exists yet to lock.
#[derive(Debug, Default)]
pub struct FingerprintLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held lock for one key. Releases on drop.
pub struct FingerprintGuard {
    _guard: OwnedMutexGuard<()>,
}

impl FingerprintLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other task holds `key`.
    pub async fn acquire(&self, key: &str) -> FingerprintGuard {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            // Drop idle entries so the map tracks only live fingerprints.
            if map.len() > 1024 {
                map.retain(|_, m| Arc::strong_count(m) > 1);
            }
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        FingerprintGuard {
            _guard: slot.lock_owned().await,
        }
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
