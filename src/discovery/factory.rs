//! 服务发现入口
//!
//! 按配置组装后端、注册器、成员缓存和解析器构建器，
//! 进程只需要持有一个 [`Discovery`]。

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DiscoveryConfig;
use crate::discovery::backend::{self, Backend};
use crate::discovery::cache::MembershipCache;
use crate::discovery::node::{NodeInfo, RegisterOptions};
use crate::discovery::resolver::ResolverBuilder;
use crate::error::Result;
use crate::registry::Registry;

/// 服务发现实例
pub struct Discovery {
    config: DiscoveryConfig,
    backend: Arc<dyn Backend>,
    registry: Registry,
    cache: Arc<MembershipCache>,
    resolver_builder: Arc<ResolverBuilder>,
    cancel: CancellationToken,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    /// 按配置连接后端并启动
    pub async fn start(config: DiscoveryConfig) -> Result<Self> {
        config.validate()?;
        let backend = backend::connect(&config).await?;
        Self::with_backend(backend, config).await
    }

    /// 使用已有后端启动
    ///
    /// 初始全量加载或监听失败时返回错误。
    pub async fn with_backend(backend: Arc<dyn Backend>, config: DiscoveryConfig) -> Result<Self> {
        let registry = Registry::new(backend.clone(), config.ttl());
        let cancel = CancellationToken::new();
        let (cache, watch_task) =
            MembershipCache::start(backend.clone(), config.watch_retry_interval(), cancel.clone()).await?;
        let resolver_builder = ResolverBuilder::new(cache.clone(), config.scheme.clone());

        info!(
            backend = backend.backend_type(),
            scheme = %config.scheme,
            services = cache.services().len(),
            "Service discovery started"
        );

        Ok(Self {
            config,
            backend,
            registry,
            cache,
            resolver_builder,
            cancel,
            watch_task: Mutex::new(Some(watch_task)),
        })
    }

    /// 注册本进程的组件节点，返回唯一 ID
    pub async fn register(&self, component: &str, address: &str, options: RegisterOptions) -> Result<i64> {
        self.registry.register(component, address, options).await
    }

    /// 注销本进程的组件节点
    pub async fn unregister(&self, component: &str) -> Result<Option<NodeInfo>> {
        self.registry.unregister(component).await
    }

    /// 本进程注册的组件节点
    pub fn registered_node(&self, component: &str) -> Option<NodeInfo> {
        self.registry.registered_node(component)
    }

    /// 按 `component` 或 `component.sub_service` 取地址
    pub fn get_addresses(&self, selector: &str) -> Vec<String> {
        self.resolver_builder.get_addresses(selector)
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<MembershipCache> {
        &self.cache
    }

    pub fn resolver_builder(&self) -> &Arc<ResolverBuilder> {
        &self.resolver_builder
    }

    /// 停止监听并关闭后端
    ///
    /// 续约随之停止。etcd 后端会撤销租约，注册键立即删除；
    /// 内存后端的注册键在 TTL 到期后删除。
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.watch_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Membership watch task failed");
            }
        }
        self.cache.clear_listener();
        self.backend.close().await;
        info!("Service discovery stopped");
    }
}
