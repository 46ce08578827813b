/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Keyed single-flight map: the first caller for a key runs the fetch, every
//! concurrent caller awaits the same slot and receives a clone of its result.
//! Completed slots stay cached until their TTL passes.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;

/// Error handed to every waiter of a failed flight.
#[derive(Debug, Clone)]
pub struct SharedError(Arc<str>);

impl SharedError {
    pub fn new(msg: impl AsRef<str>) -> Self {
        Self(Arc::from(msg.as_ref()))
    }
}

impl From<anyhow::Error> for SharedError {
    fn from(e: anyhow::Error) -> Self {
        Self::new(format!("{e:#}"))
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for SharedError {}

pub type Shared<T> = Result<T, SharedError>;

struct Flight<T> {
    cell: OnceCell<Shared<T>>,
    born: Instant,
    ttl: Duration,
    error_ttl: Duration,
}

impl<T> Flight<T> {
    fn expired(&self, now: Instant) -> bool {
        let age = now.saturating_duration_since(self.born);
        match self.cell.get() {
            None => false,
            Some(Ok(_)) => age >= self.ttl,
            Some(Err(_)) => age >= self.error_ttl,
        }
    }
}

pub struct SingleFlight<K, T> {
    slots: Mutex<HashMap<K, Arc<Flight<T>>>>,
    wait_limit: Duration,
    error_ttl: Duration,
    sweep_every: Duration,
    last_sweep: Mutex<Instant>,
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    /// `wait_limit` bounds the leader's fetch, `error_ttl` how long a failure
    /// is served from cache, `sweep_every` how often opportunistic sweeps run.
    pub fn new(wait_limit: Duration, error_ttl: Duration, sweep_every: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            wait_limit,
            error_ttl,
            sweep_every,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub async fn get<F, Fut>(&self, key: K, ttl: Duration, fetch: F) -> Shared<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.maybe_sweep();
        let flight = {
            let mut slots = lock(&self.slots);
            let now = Instant::now();
            match slots.get(&key) {
                Some(f) if !f.expired(now) => f.clone(),
                _ => {
                    let f = Arc::new(Flight {
                        cell: OnceCell::new(),
                        born: now,
                        ttl,
                        error_ttl: self.error_ttl.min(ttl),
                    });
                    slots.insert(key, f.clone());
                    f
                }
            }
        };
        let limit = self.wait_limit;
        flight
            .cell
            .get_or_init(|| async move {
                match tokio::time::timeout(limit, fetch()).await {
                    Ok(Ok(v)) => Ok(v),
                    Ok(Err(e)) => Err(SharedError::from(e)),
                    Err(_) => Err(SharedError::new(format!(
                        "timed out after {}s",
                        limit.as_secs()
                    ))),
                }
            })
            .await
            .clone()
    }

    /// Completed value for `key`, if any and not expired.
    pub fn peek(&self, key: &K) -> Option<Shared<T>> {
        let slots = lock(&self.slots);
        let f = slots.get(key)?;
        if f.expired(Instant::now()) {
            return None;
        }
        f.cell.get().cloned()
    }

    pub fn maybe_sweep(&self) -> usize {
        {
            let mut last = lock(&self.last_sweep);
            let now = Instant::now();
            if now.saturating_duration_since(*last) < self.sweep_every {
                return 0;
            }
            *last = now;
        }
        self.sweep()
    }

    /// Evicts completed entries past their TTL. In-flight entries are kept.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut slots = lock(&self.slots);
        let before = slots.len();
        slots.retain(|_, f| !f.expired(now));
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<(K, Option<Shared<T>>)> {
        lock(&self.slots)
            .iter()
            .map(|(k, f)| (k.clone(), f.cell.get().cloned()))
            .collect()
    }
}
