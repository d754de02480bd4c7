//! # Lock Manager
//!
//! Exclusive per-resource locks with ordered acquisition.
//!
//! Every caller sorts its resource keys into the canonical order and takes
//! them one at a time, so two holders can never wait on each other in a
//! cycle. A wait that outlives the deadline gives back every lock the call
//! took and fails with `LockTimeout`.
//!
//! ```text
//!   acquire([b, a, c])  ──►  sort/dedup  ──►  a ─► b ─► c
//!                                              │    │    │
//!                                         free? take, else wait on
//!                                         release notification until
//!                                         deadline
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use cairn_core::{
    error::{Error, Result},
    metrics::Metrics,
    LockHolder, ResourceKey,
};

pub struct LockManager {
    table: Mutex<HashMap<ResourceKey, LockHolder>>,
    released: Notify,
    default_timeout: Duration,
    metrics: Metrics,
}

impl LockManager {
    pub fn new(default_timeout: Duration, metrics: Metrics) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            released: Notify::new(),
            default_timeout,
            metrics,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Lock every key for `holder`, in canonical order.
    ///
    /// Keys the holder already owns are skipped. Returns the keys this call
    /// newly acquired. With `timeout = None` the default timeout applies.
    pub async fn acquire(
        &self,
        keys: &[ResourceKey],
        holder: LockHolder,
        timeout: Option<Duration>,
    ) -> Result<Vec<ResourceKey>> {
        let mut ordered = keys.to_vec();
        ordered.sort();
        ordered.dedup();

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout.unwrap_or(self.default_timeout);
        let mut taken = Vec::with_capacity(ordered.len());

        for key in ordered {
            loop {
                // register before checking so a release in between is not missed
                let notified = self.released.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.try_take(&key, holder, &mut taken) {
                    break;
                }

                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    let waited_ms = started.elapsed().as_millis() as u64;
                    warn!("{} timed out after {}ms waiting for {}", holder, waited_ms, key);
                    self.release_keys(holder, &taken);
                    self.metrics.record_lock_timeout();
                    return Err(Error::LockTimeout {
                        key: key.to_string(),
                        waited_ms,
                    });
                }
            }
        }

        debug!("{} acquired {} locks", holder, taken.len());
        Ok(taken)
    }

    fn try_take(&self, key: &ResourceKey, holder: LockHolder, taken: &mut Vec<ResourceKey>) -> bool {
        let mut table = self.table.lock();
        match table.get(key) {
            None => {
                table.insert(key.clone(), holder);
                taken.push(key.clone());
                true
            }
            Some(current) => *current == holder,
        }
    }

    /// Release the given keys if `holder` owns them.
    pub fn release_keys(&self, holder: LockHolder, keys: &[ResourceKey]) {
        if keys.is_empty() {
            return;
        }
        {
            let mut table = self.table.lock();
            for key in keys {
                if table.get(key) == Some(&holder) {
                    table.remove(key);
                }
            }
        }
        self.released.notify_waiters();
    }

    /// Release every lock of `holder`. Returns how many were held.
    pub fn release(&self, holder: LockHolder) -> usize {
        let released = {
            let mut table = self.table.lock();
            let before = table.len();
            table.retain(|_, h| *h != holder);
            before - table.len()
        };
        if released > 0 {
            debug!("{} released {} locks", holder, released);
            self.released.notify_waiters();
        }
        released
    }

    pub fn holder_of(&self, key: &ResourceKey) -> Option<LockHolder> {
        self.table.lock().get(key).copied()
    }

    /// Keys held by `holder`, in canonical order.
    pub fn held_by(&self, holder: LockHolder) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> = self
            .table
            .lock()
            .iter()
            .filter(|(_, h)| **h == holder)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
