//! Per-key mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
struct Registry {
    entries: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    lock: Arc<tokio::sync::Mutex<()>>,
    /// Holders plus waiters. The entry is dropped from the map when this
    /// reaches zero, so the map never grows beyond the live key set.
    refs: usize,
}

/// A mutex keyed by string.
///
/// `lock` blocks until the key is free. Fairness is not guaranteed.
/// Cancelling the returned future (dropping it before it resolves) safely
/// abandons the wait.
#[derive(Clone, Default)]
pub struct KeyedMutex {
    registry: Arc<Registry>,
}

/// Holds a key locked until dropped.
pub struct KeyedGuard {
    // Field order matters: the lock must release before the registration
    // decrements, or a fresh entry could be created while the key is held.
    _lock: OwnedMutexGuard<()>,
    _registration: Registration,
}

struct Registration {
    registry: Arc<Registry>,
    key: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut entries = self.registry.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(&self.key);
            }
        }
    }
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting until it is free.
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let lock = {
            let mut entries = self.registry.entries.lock().unwrap();
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                refs: 0,
            });
            entry.refs += 1;
            entry.lock.clone()
        };
        // Registered before awaiting so a cancelled wait still decrements.
        let registration = Registration {
            registry: self.registry.clone(),
            key: key.to_string(),
        };

        let guard = lock.lock_owned().await;

        KeyedGuard {
            _lock: guard,
            _registration: registration,
        }
    }

    #[cfg(test)]
    fn live_keys(&self) -> usize {
        self.registry.entries.lock().unwrap().len()
    }
}
