//! One FIFO mutual-exclusion gate per assistant.
//!
//! Locks are created once, for every configured assistant, when the manager
//! is built. Unknown ids never get a lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

pub struct InteractionLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

/// Result of [`InteractionLocks::drain`].
pub struct Drained {
    /// Held until dropped so no new interaction can start.
    pub guards: Vec<OwnedMutexGuard<()>>,
    /// Assistants whose interaction was still running at the deadline.
    pub abandoned: Vec<String>,
}

impl InteractionLocks {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            locks: ids
                .into_iter()
                .map(|id| (id.into(), Arc::new(Mutex::new(()))))
                .collect(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.locks.contains_key(id)
    }

    /// Wait for `id`'s lock. The guard can be moved into a spawned task.
    pub async fn acquire(&self, id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = self.locks.get(id)?.clone();
        Some(lock.lock_owned().await)
    }

    /// Run `fut` while holding `id`'s lock. Returns `None` for unknown ids.
    pub async fn with_lock<F, T>(&self, id: &str, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let _guard = self.acquire(id).await?;
        Some(fut.await)
    }

    pub fn is_busy(&self, id: &str) -> bool {
        self.locks
            .get(id)
            .map(|l| l.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Take every lock once, giving in-flight interactions up to `grace` to
    /// finish.
    pub async fn drain(&self, grace: Duration) -> Drained {
        let deadline = tokio::time::Instant::now() + grace;
        let waits = self.locks.iter().map(|(id, lock)| {
            let lock = lock.clone();
            let id = id.clone();
            async move {
                match tokio::time::timeout_at(deadline, lock.lock_owned()).await {
                    Ok(guard) => Ok(guard),
                    Err(_) => Err(id),
                }
            }
        });

        let mut drained = Drained {
            guards: Vec::new(),
            abandoned: Vec::new(),
        };
        for result in futures::future::join_all(waits).await {
            match result {
                Ok(guard) => drained.guards.push(guard),
                Err(id) => {
                    warn!(assistant = %id, "Interaction still running at shutdown deadline");
                    drained.abandoned.push(id);
                }
            }
        }
        drained.abandoned.sort();
        drained
    }
}
