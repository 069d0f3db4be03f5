//! 服务发现后端抽象和实现
//!
//! 后端是一个带版本号的 KV 存储，提供前缀查询、原子计数器、TTL 续约和推送式监听。

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::{BackendType, DiscoveryConfig};
use crate::error::Result;

#[cfg(feature = "etcd")]
pub use etcd::EtcdBackend;
pub use memory::MemoryBackend;

/// 一个键值对及其存储级单调版本号
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: String,
    pub version: i64,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: impl Into<String>, version: i64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            version,
        }
    }
}

/// 一次查询的结果
///
/// `version` 是查询时刻的存储版本，用于作为后续 `watch` 的起点，
/// 保证查询与监听之间不会漏掉更新。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvPairs {
    pub pairs: Vec<KvPair>,
    pub version: i64,
}

impl KvPairs {
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }
}

/// 监听事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// 键被创建或更新
    Update(KvPair),
    /// 键被删除或过期
    Delete(KvPair),
    /// 增量视图可能已过期，需要重新全量加载
    Refresh,
}

impl WatchEvent {
    /// 事件类型名称（用于日志）
    pub fn kind(&self) -> &'static str {
        match self {
            WatchEvent::Update(_) => "update",
            WatchEvent::Delete(_) => "delete",
            WatchEvent::Refresh => "refresh",
        }
    }

    /// 事件关联的键值对
    pub fn kv(&self) -> Option<&KvPair> {
        match self {
            WatchEvent::Update(kv) | WatchEvent::Delete(kv) => Some(kv),
            WatchEvent::Refresh => None,
        }
    }
}

/// 监听事件接收端
pub type WatchReceiver = mpsc::UnboundedReceiver<WatchEvent>;

/// 服务发现后端 trait
///
/// 所有后端（etcd、内存调试存储）都需要实现这个 trait。
/// 由于需要动态分发（dyn），使用 async-trait。
#[async_trait]
pub trait Backend: Send + Sync {
    /// 后端标识，仅用于日志
    fn backend_type(&self) -> &'static str;

    /// 写入键值，`ttl` 为零表示永不过期
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// 单键查询或前缀查询
    async fn get(&self, key: &str, is_prefix: bool) -> Result<KvPairs>;

    /// 删除键，键不存在时也返回成功
    async fn delete(&self, key: &str) -> Result<()>;

    /// 原子自增计数器，从 1 开始，永不重置
    async fn incr(&self, key: &str) -> Result<i64>;

    /// 从 `from_version` 之后开始监听
    ///
    /// 无法保证从该版本起无缝投递时，必须发送 [`WatchEvent::Refresh`]，
    /// 而不是静默丢弃更新。
    async fn watch(&self, key: &str, from_version: i64, is_prefix: bool) -> Result<WatchReceiver>;

    /// 写入键值并持续续约 TTL，续约由后端负责直到 `delete` 或 `close`
    async fn keep_alive(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// 释放后端连接，可重复调用
    async fn close(&self);
}

/// 根据配置创建后端
pub async fn connect(config: &DiscoveryConfig) -> Result<Arc<dyn Backend>> {
    match config.backend {
        BackendType::Etcd => connect_etcd(config).await,
        BackendType::Memory => {
            let backend = MemoryBackend::new();
            backend.spawn_sweeper(memory::SWEEP_INTERVAL);
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(feature = "etcd")]
async fn connect_etcd(config: &DiscoveryConfig) -> Result<Arc<dyn Backend>> {
    let backend = EtcdBackend::connect(&config.endpoints).await?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "etcd"))]
async fn connect_etcd(_config: &DiscoveryConfig) -> Result<Arc<dyn Backend>> {
    Err(crate::error::DiscoveryError::Config(
        "etcd backend requires the `etcd` feature".to_string(),
    ))
}
