//! In-process store with the same semantics as the Redis primitives.
//!
//! Every handle created from one [`MemoryStore`] shares its data, the way
//! separate connections share one Redis server. Operations lock the data
//! for their own duration only, so a `zrange_by_score` followed by a
//! `zrem` interleaves with other handles exactly as two round trips would.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Conn, Connector, ScoreRange};

#[derive(Default)]
struct Data {
    counters: HashMap<String, i64>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    // Kept sorted by (score, member), matching sorted-set order.
    sorted_sets: HashMap<String, Vec<(f64, String)>>,
}

#[derive(Default)]
struct Shared {
    data: Mutex<Data>,
    pushed: Notify,
    failures: AtomicUsize,
    write_delay: Mutex<Duration>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conn(&self) -> MemoryConn {
        MemoryConn {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Make the next `count` operations on any handle fail, to exercise
    /// error paths of callers.
    pub fn fail_next_operations(&self, count: usize) {
        self.shared.failures.store(count, Ordering::SeqCst);
    }

    /// Hold every later `hset_all` for `delay` before it writes, to widen
    /// the window between a caller deciding an outcome and saving it.
    pub fn delay_writes(&self, delay: Duration) {
        *self
            .shared
            .write_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn list_len(&self, key: &str) -> usize {
        self.shared
            .lock()
            .lists
            .get(key)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn sorted_set_members(&self, key: &str) -> Vec<(f64, String)> {
        self.shared
            .lock()
            .sorted_sets
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MemoryStore {
    async fn connect(&self) -> Result<Box<dyn Conn>> {
        Ok(Box::new(self.conn()))
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Data> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_failure(&self) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok();
        if injected {
            anyhow::bail!("memory store: injected failure");
        }
        Ok(())
    }

    fn pop_first(&self, keys: &[String]) -> Option<(String, String)> {
        let mut data = self.lock();
        for key in keys {
            if let Some(list) = data.lists.get_mut(key)
                && let Some(value) = list.pop_front()
            {
                if list.is_empty() {
                    data.lists.remove(key);
                }
                return Some((key.clone(), value));
            }
        }
        None
    }
}

pub struct MemoryConn {
    shared: Arc<Shared>,
}

#[async_trait]
impl Conn for MemoryConn {
    async fn incr(&mut self, key: &str) -> Result<i64> {
        self.shared.check_failure()?;
        let mut data = self.shared.lock();
        let counter = data.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>> {
        self.shared.check_failure()?;
        Ok(self.shared.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hset_all(&mut self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        self.shared.check_failure()?;
        let delay = *self
            .shared
            .write_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut data = self.shared.lock();
        let hash = data.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    async fn rpush(&mut self, key: &str, values: &[String]) -> Result<i64> {
        self.shared.check_failure()?;
        let len = {
            let mut data = self.shared.lock();
            let list = data.lists.entry(key.to_string()).or_default();
            list.extend(values.iter().cloned());
            list.len()
        };
        self.shared.pushed.notify_waiters();
        Ok(len as i64)
    }

    async fn blpop(
        &mut self,
        timeout: Duration,
        keys: &[String],
    ) -> Result<Option<(String, String)>> {
        self.shared.check_failure()?;
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before looking, so a push between the check
            // and the wait still wakes us.
            let notified = self.shared.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(hit) = self.shared.pop_first(keys) {
                return Ok(Some(hit));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn zadd_nx(&mut self, key: &str, score: f64, member: &str) -> Result<i64> {
        self.shared.check_failure()?;
        let mut data = self.shared.lock();
        let set = data.sorted_sets.entry(key.to_string()).or_default();
        if set.iter().any(|(_, existing)| existing == member) {
            return Ok(0);
        }
        let position = set.partition_point(|(existing_score, existing_member)| {
            existing_score
                .total_cmp(&score)
                .then_with(|| existing_member.as_str().cmp(member))
                .is_lt()
        });
        set.insert(position, (score, member.to_string()));
        Ok(1)
    }

    async fn zrem(&mut self, key: &str, member: &str) -> Result<i64> {
        self.shared.check_failure()?;
        let mut data = self.shared.lock();
        let Some(set) = data.sorted_sets.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|(_, existing)| existing != member);
        let removed = before - set.len();
        if set.is_empty() {
            data.sorted_sets.remove(key);
        }
        Ok(removed as i64)
    }

    async fn zrange_by_score(&mut self, key: &str, range: ScoreRange) -> Result<Vec<String>> {
        self.shared.check_failure()?;
        let data = self.shared.lock();
        let Some(set) = data.sorted_sets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(set
            .iter()
            .filter(|(score, _)| range.contains(*score))
            .skip(range.offset)
            .take(range.count)
            .map(|(_, member)| member.clone())
            .collect())
    }
}
