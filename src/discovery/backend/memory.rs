//! 内存调试后端
//!
//! 单进程内的带版本 KV 存储，语义与 etcd 后端一致，用于本地调试和测试。
//! 保留有限长度的事件历史，监听可以从历史中的任意版本回放；
//! 历史已不覆盖请求的版本时先发送 `Refresh`。

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Backend, KvPair, KvPairs, WatchEvent, WatchReceiver};
use crate::config::keep_alive_interval_for;
use crate::error::{DiscoveryError, Result};

/// 过期扫描间隔
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// 默认保留的事件历史条数
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

struct Entry {
    value: String,
    version: i64,
    deadline: Option<Instant>,
}

struct Watcher {
    key: String,
    is_prefix: bool,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl Watcher {
    fn matches(&self, key: &str) -> bool {
        if self.is_prefix {
            key.starts_with(&self.key)
        } else {
            key == self.key
        }
    }
}

struct MemoryState {
    revision: i64,
    /// 历史中已被丢弃的最大版本
    compacted: i64,
    history_limit: usize,
    entries: BTreeMap<String, Entry>,
    history: VecDeque<(i64, WatchEvent)>,
    watchers: Vec<Watcher>,
}

impl MemoryState {
    fn new(history_limit: usize) -> Self {
        Self {
            revision: 0,
            compacted: 0,
            history_limit,
            entries: BTreeMap::new(),
            history: VecDeque::new(),
            watchers: Vec::new(),
        }
    }

    fn put(&mut self, key: &str, value: &str, deadline: Option<Instant>) {
        self.revision += 1;
        let version = self.revision;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                version,
                deadline,
            },
        );
        self.publish(version, WatchEvent::Update(KvPair::new(key, value, version)));
    }

    fn remove(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        self.revision += 1;
        let version = self.revision;
        self.publish(version, WatchEvent::Delete(KvPair::new(key, entry.value, version)));
        true
    }

    fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline.is_some_and(|d| d <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            debug!(key = %key, "memory backend entry expired");
            self.remove(key);
        }
        expired.len()
    }

    fn publish(&mut self, version: i64, event: WatchEvent) {
        if let Some(kv) = event.kv() {
            let key = kv.key.as_str();
            self.watchers.retain(|w| {
                if w.matches(key) {
                    w.tx.send(event.clone()).is_ok()
                } else {
                    !w.tx.is_closed()
                }
            });
        }

        self.history.push_back((version, event));
        while self.history.len() > self.history_limit {
            if let Some((dropped, _)) = self.history.pop_front() {
                self.compacted = dropped;
            }
        }
    }

    fn compact(&mut self, revision: i64) {
        while let Some((version, _)) = self.history.front() {
            if *version > revision {
                break;
            }
            self.compacted = *version;
            self.history.pop_front();
        }
        if revision > self.compacted {
            self.compacted = revision.min(self.revision);
        }
    }
}

/// 内存调试后端
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    keepers: Arc<DashMap<String, CancellationToken>>,
    closed: CancellationToken,
}

impl MemoryBackend {
    /// 创建新的内存后端
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// 创建指定历史长度的内存后端
    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::new(history_limit.max(1)))),
            keepers: Arc::new(DashMap::new()),
            closed: CancellationToken::new(),
        }
    }

    /// 当前存储版本
    pub fn revision(&self) -> i64 {
        self.state.lock().revision
    }

    /// 删除所有已过期的键并发送 `Delete` 事件，返回删除数量
    pub fn sweep_expired(&self) -> usize {
        self.state.lock().expire(Instant::now())
    }

    /// 启动后台过期扫描任务，随 `close` 停止
    pub fn spawn_sweeper(&self, interval: Duration) {
        let backend = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = backend.closed.cancelled() => break,
                    _ = ticker.tick() => {
                        backend.sweep_expired();
                    }
                }
            }
        });
    }

    /// 丢弃 `revision` 及之前的事件历史
    ///
    /// 之后从更早版本开始的监听会先收到 `Refresh`。
    pub fn compact(&self, revision: i64) {
        self.state.lock().compact(revision);
    }

    /// 向所有监听者发送 `Refresh`，模拟监听通道丢失
    pub fn broadcast_refresh(&self) {
        let mut state = self.state.lock();
        state
            .watchers
            .retain(|w| w.tx.send(WatchEvent::Refresh).is_ok());
    }

    /// 当前活跃的监听者数量
    pub fn watcher_count(&self) -> usize {
        let mut state = self.state.lock();
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            Err(DiscoveryError::Closed)
        } else {
            Ok(())
        }
    }

    fn deadline(ttl: Duration) -> Option<Instant> {
        if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        }
    }

    fn renew(&self, key: &str, value: &str, ttl: Duration) {
        let mut state = self.state.lock();
        let deadline = Self::deadline(ttl);
        // 值未变化时只延长期限，不产生事件
        let unchanged = state.entries.get(key).is_some_and(|e| e.value == value);
        if unchanged {
            if let Some(entry) = state.entries.get_mut(key) {
                entry.deadline = deadline;
            }
        } else {
            state.put(key, value, deadline);
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn backend_type(&self) -> &'static str {
        "memory"
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.expire(Instant::now());
        state.put(key, value, Self::deadline(ttl));
        Ok(())
    }

    async fn get(&self, key: &str, is_prefix: bool) -> Result<KvPairs> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.expire(Instant::now());

        let to_pair = |(k, e): (&String, &Entry)| KvPair::new(k.as_str(), e.value.as_str(), e.version);
        let pairs = if is_prefix {
            state
                .entries
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(to_pair)
                .collect()
        } else {
            state
                .entries
                .get_key_value(key)
                .map(to_pair)
                .into_iter()
                .collect()
        };

        Ok(KvPairs {
            pairs,
            version: state.revision,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        if let Some((_, keeper)) = self.keepers.remove(key) {
            keeper.cancel();
        }
        self.state.lock().remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let current = match state.entries.get(key) {
            Some(entry) => entry.value.parse::<i64>().map_err(|e| {
                DiscoveryError::backend("incr", format!("counter {} is not an integer: {}", key, e))
            })?,
            None => 0,
        };
        let next = current + 1;
        state.put(key, &next.to_string(), None);
        Ok(next)
    }

    async fn watch(&self, key: &str, from_version: i64, is_prefix: bool) -> Result<WatchReceiver> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Watcher {
            key: key.to_string(),
            is_prefix,
            tx,
        };

        let mut state = self.state.lock();
        state.expire(Instant::now());
        if from_version < state.compacted {
            debug!(
                key = %key,
                from_version,
                compacted = state.compacted,
                "watch version already compacted, sending refresh"
            );
            let _ = watcher.tx.send(WatchEvent::Refresh);
        } else {
            for (version, event) in state.history.iter() {
                if *version <= from_version {
                    continue;
                }
                if event.kv().is_some_and(|kv| watcher.matches(&kv.key)) {
                    let _ = watcher.tx.send(event.clone());
                }
            }
        }
        state.watchers.push(watcher);

        Ok(rx)
    }

    async fn keep_alive(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        {
            let mut state = self.state.lock();
            state.expire(Instant::now());
            state.put(key, value, Self::deadline(ttl));
        }

        let token = self.closed.child_token();
        if let Some(previous) = self.keepers.insert(key.to_string(), token.clone()) {
            previous.cancel();
        }

        let backend = self.clone();
        let key = key.to_string();
        let value = value.to_string();
        let interval = keep_alive_interval_for(ttl);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        backend.renew(&key, &value, ttl);
                    }
                }
            }
            debug!(key = %key, "memory keep-alive stopped");
        });

        Ok(())
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.keepers.clear();
        self.state.lock().watchers.clear();
        info!("memory backend closed");
    }
}
