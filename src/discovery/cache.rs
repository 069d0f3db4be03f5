//! 成员缓存
//!
//! 启动时全量加载 `service/` 前缀，然后从加载版本开始监听同一前缀。
//! 每个 `Update`/`Delete` 事件都会重新加载受影响服务的全部节点并整体替换缓存，
//! 因为节点元数据（提供的子服务）可能变化，只有整体重载才能保证视图一致。
//! `Refresh` 事件重新全量加载。

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::discovery::backend::{Backend, KvPairs, WatchEvent, WatchReceiver};
use crate::discovery::node::{NodeInfo, SERVICE_PREFIX, service_name_from_key, service_prefix};
use crate::error::Result;

/// 地址变化监听者
///
/// 成员缓存在每次服务节点变化后推送最新地址列表。
pub trait AddressListener: Send + Sync {
    fn on_addresses(&self, service: &str, addresses: &[String]);
}

/// 成员缓存
pub struct MembershipCache {
    backend: Arc<dyn Backend>,
    /// 服务名 → (地址 → 节点)
    remote: DashMap<String, HashMap<String, NodeInfo>>,
    listener: RwLock<Option<Weak<dyn AddressListener>>>,
    retry_interval: Duration,
}

impl MembershipCache {
    /// 创建空缓存，不访问后端
    pub fn new(backend: Arc<dyn Backend>, retry_interval: Duration) -> Self {
        Self {
            backend,
            remote: DashMap::new(),
            listener: RwLock::new(None),
            retry_interval,
        }
    }

    /// 全量加载并启动监听任务
    ///
    /// 初始加载或监听注册失败时返回错误，进程无法发现其他节点，不应继续启动。
    pub async fn start(
        backend: Arc<dyn Backend>,
        retry_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<(Arc<Self>, JoinHandle<()>)> {
        let cache = Arc::new(Self::new(backend, retry_interval));
        let rx = cache.refresh().await.inspect_err(|e| {
            error!(error = %e, "Initial service listing or watch failed");
        })?;

        let task = tokio::spawn(cache.clone().watch_events(rx, cancel));
        Ok((cache, task))
    }

    /// 注册地址监听者，替换之前的监听者
    pub fn set_listener(&self, listener: Weak<dyn AddressListener>) {
        *self.listener.write() = Some(listener);
    }

    /// 移除地址监听者
    pub fn clear_listener(&self) {
        *self.listener.write() = None;
    }

    /// 指定服务的节点快照
    pub fn nodes(&self, service: &str) -> Option<HashMap<String, NodeInfo>> {
        self.remote.get(service).map(|e| e.value().clone())
    }

    /// 指定服务的地址列表（已排序）
    pub fn addresses(&self, service: &str) -> Vec<String> {
        self.remote
            .get(service)
            .map(|e| sorted_addresses(e.value()))
            .unwrap_or_default()
    }

    /// 当前缓存的所有服务名
    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.remote.iter().map(|e| e.key().clone()).collect();
        services.sort();
        services
    }

    /// 全量加载并从加载版本开始监听
    async fn refresh(&self) -> Result<WatchReceiver> {
        let version = self.get_services().await?;
        self.backend.watch(SERVICE_PREFIX, version, true).await
    }

    /// 全量加载 `service/` 前缀，返回加载时的版本
    pub async fn get_services(&self) -> Result<i64> {
        let kvs = self.backend.get(SERVICE_PREFIX, true).await?;
        let version = kvs.version;

        let mut grouped: HashMap<String, HashMap<String, NodeInfo>> = HashMap::new();
        for node in decode_nodes(&kvs) {
            grouped
                .entry(node.service.clone())
                .or_default()
                .insert(node.address.clone(), node);
        }

        // 已经不存在的服务需要清空
        let stale: Vec<String> = self
            .remote
            .iter()
            .map(|e| e.key().clone())
            .filter(|s| !grouped.contains_key(s))
            .collect();
        for service in stale {
            self.update_resolver(&service, HashMap::new());
        }

        for (service, nodes) in grouped {
            self.update_resolver(&service, nodes);
        }

        debug!(version, services = self.remote.len(), "Service listing loaded");
        Ok(version)
    }

    /// 重新加载单个服务的全部节点
    pub async fn update_service(&self, service: &str) -> Result<i64> {
        let kvs = self.backend.get(&service_prefix(service), true).await?;
        let nodes = decode_nodes(&kvs)
            .into_iter()
            .map(|node| (node.address.clone(), node))
            .collect();
        self.update_resolver(service, nodes);
        Ok(kvs.version)
    }

    /// 替换服务的节点并推送地址列表
    fn update_resolver(&self, service: &str, nodes: HashMap<String, NodeInfo>) {
        let addresses = sorted_addresses(&nodes);
        if nodes.is_empty() {
            self.remote.remove(service);
        } else {
            self.remote.insert(service.to_string(), nodes);
        }
        debug!(service = %service, addresses = ?addresses, "Service nodes updated");

        let listener = self.listener.read().as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            listener.on_addresses(service, &addresses);
        }
    }

    /// 处理单个监听事件，失败只记录日志
    async fn handle_event(&self, event: WatchEvent) {
        match &event {
            WatchEvent::Refresh => {
                info!("Refresh event received, reloading all services");
                if let Err(e) = self.get_services().await {
                    warn!(event = "refresh", error = %e, "Failed to reload services");
                }
            }
            WatchEvent::Update(kv) | WatchEvent::Delete(kv) => {
                let Some(service) = service_name_from_key(SERVICE_PREFIX, &kv.key) else {
                    debug!(key = %kv.key, "Ignoring event outside service layout");
                    return;
                };
                if let Err(e) = self.update_service(service).await {
                    warn!(
                        service = %service,
                        key = %kv.key,
                        event = event.kind(),
                        error = %e,
                        "Failed to reload service"
                    );
                }
            }
        }
    }

    /// 监听事件循环，按投递顺序逐个处理
    async fn watch_events(self: Arc<Self>, mut rx: WatchReceiver, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = rx.recv() => event,
            };

            match event {
                Some(event) => self.handle_event(event).await,
                None => {
                    warn!("Watch channel closed, re-establishing");
                    match self.rewatch(&cancel).await {
                        Some(next) => rx = next,
                        None => break,
                    }
                }
            }
        }

        self.backend.close().await;
        info!("Membership watch stopped");
    }

    /// 重新全量加载并重新监听，直到成功或被取消
    async fn rewatch(&self, cancel: &CancellationToken) -> Option<WatchReceiver> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
            match self.refresh().await {
                Ok(rx) => {
                    info!("Watch re-established");
                    return Some(rx);
                }
                Err(e) => warn!(error = %e, "Failed to re-establish watch"),
            }
        }
    }
}

fn decode_nodes(kvs: &KvPairs) -> Vec<NodeInfo> {
    kvs.pairs
        .iter()
        .filter_map(|kv| match NodeInfo::decode(&kv.value) {
            Ok(node) => Some(node),
            Err(e) => {
                warn!(key = %kv.key, error = %e, "Skipping undecodable node");
                None
            }
        })
        .collect()
}

fn sorted_addresses(nodes: &HashMap<String, NodeInfo>) -> Vec<String> {
    let mut addresses: Vec<String> = nodes.keys().cloned().collect();
    addresses.sort();
    addresses
}
