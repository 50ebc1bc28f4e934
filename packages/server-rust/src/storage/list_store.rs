//! In-memory keyed lists with Redis list semantics.
//!
//! Index 0 is the head: `LPUSH` prepends and `RPOP` removes from the tail,
//! so `LPUSH` + `RPOP` is a FIFO queue. A list that becomes empty is removed,
//! matching Redis, so `LLEN` of a drained queue and of a missing key agree.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Notify;

/// Concurrent map of lists, plus a wakeup for blocked poppers.
#[derive(Debug, Default)]
pub struct ListStore {
    lists: DashMap<String, VecDeque<Bytes>>,
    pushed: Notify,
    password: Option<String>,
}

impl ListStore {
    /// Creates an empty store that accepts any client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store that requires `AUTH password` first.
    #[must_use]
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Prepends each value in turn; returns the new length.
    pub fn lpush(&self, key: &str, values: impl IntoIterator<Item = Bytes>) -> usize {
        let len = {
            let mut list = self.lists.entry(key.to_string()).or_default();
            for value in values {
                list.push_front(value);
            }
            list.len()
        };
        self.pushed.notify_waiters();
        len
    }

    /// Appends each value in turn; returns the new length.
    pub fn rpush(&self, key: &str, values: impl IntoIterator<Item = Bytes>) -> usize {
        let len = {
            let mut list = self.lists.entry(key.to_string()).or_default();
            list.extend(values);
            list.len()
        };
        self.pushed.notify_waiters();
        len
    }

    /// Removes the head, the most recent `LPUSH`. An emptied list is deleted.
    pub fn lpop(&self, key: &str) -> Option<Bytes> {
        self.pop(key, VecDeque::pop_front)
    }

    /// Removes the tail, the oldest `LPUSH`.
    pub fn rpop(&self, key: &str) -> Option<Bytes> {
        self.pop(key, VecDeque::pop_back)
    }

    fn pop(&self, key: &str, take: fn(&mut VecDeque<Bytes>) -> Option<Bytes>) -> Option<Bytes> {
        let value = {
            let mut list = self.lists.get_mut(key)?;
            take(list.value_mut())
        };
        // The shard guard must be released before `remove_if` takes it again.
        self.lists.remove_if(key, |_, list| list.is_empty());
        value
    }

    /// Pops the tail of the first non-empty list among `keys`.
    pub fn rpop_first<K: AsRef<str>>(&self, keys: &[K]) -> Option<(String, Bytes)> {
        keys.iter().find_map(|key| {
            let key = key.as_ref();
            self.rpop(key).map(|value| (key.to_string(), value))
        })
    }

    /// Blocking variant of [`ListStore::rpop_first`].
    ///
    /// Waits until one of `keys` has an element or `timeout` elapses. `None`
    /// as the timeout waits forever.
    pub async fn brpop<K: AsRef<str>>(
        &self,
        keys: &[K],
        timeout: Option<Duration>,
    ) -> Option<(String, Bytes)> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            // Register interest before checking so a push in between is not missed.
            notified.as_mut().enable();

            if let Some(hit) = self.rpop_first(keys) {
                return Some(hit);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Keeps only the elements in `start..=stop` (inclusive, negative
    /// indexes count from the tail).
    pub fn ltrim(&self, key: &str, start: i64, stop: i64) {
        {
            let Some(mut list) = self.lists.get_mut(key) else {
                return;
            };
            match normalize_range(list.len(), start, stop) {
                Some((from, to)) => {
                    list.truncate(to + 1);
                    list.drain(..from);
                }
                None => list.clear(),
            }
        }
        self.lists.remove_if(key, |_, list| list.is_empty());
    }

    #[must_use]
    pub fn llen(&self, key: &str) -> usize {
        self.lists.get(key).map_or(0, |list| list.len())
    }

    /// Elements in `start..=stop`, head first.
    #[must_use]
    pub fn lrange(&self, key: &str, start: i64, stop: i64) -> Vec<Bytes> {
        let Some(list) = self.lists.get(key) else {
            return Vec::new();
        };
        match normalize_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Removes `keys`; returns how many existed.
    pub fn del<K: AsRef<str>>(&self, keys: &[K]) -> usize {
        keys.iter()
            .filter(|key| {
                let key: &str = key.as_ref();
                self.lists.remove(key).is_some()
            })
            .count()
    }

    pub fn flush_all(&self) {
        self.lists.clear();
    }

    /// Number of non-empty lists.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.lists.len()
    }
}

/// Resolves Redis-style inclusive indexes against a list of `len` elements.
///
/// Returns `None` when the range selects nothing.
fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = i64::try_from(len).ok()?;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((usize::try_from(start).ok()?, usize::try_from(stop).ok()?))
}
