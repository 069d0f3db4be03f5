//! 节点注册
//!
//! 为组件分配单调递增的唯一 ID，并把节点信息写入带 TTL 的注册键。

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::discovery::backend::Backend;
use crate::discovery::node::{NodeInfo, RegisterOptions, node_id_key, service_key};
use crate::error::{DiscoveryError, Result};

/// 节点注册器
///
/// 本地注册表只保存本进程注册的节点，用于无需访问后端即可回答
/// “我是谁”的查询。注册成功后由后端负责续约。
pub struct Registry {
    backend: Arc<dyn Backend>,
    default_ttl: Duration,
    local: DashMap<String, NodeInfo>,
}

impl Registry {
    /// 创建新的注册器
    pub fn new(backend: Arc<dyn Backend>, default_ttl: Duration) -> Self {
        Self {
            backend,
            default_ttl,
            local: DashMap::new(),
        }
    }

    /// 注册组件节点，返回分配的唯一 ID
    ///
    /// `isolate` 为真时只分配 ID，不发布注册信息。
    /// 后端错误原样返回，不做重试，由调用方决定是否致命。
    pub async fn register(
        &self,
        component: &str,
        address: &str,
        options: RegisterOptions,
    ) -> Result<i64> {
        let ttl = options.ttl.unwrap_or(self.default_ttl);
        if !options.isolate && ttl.is_zero() {
            return Err(DiscoveryError::Config(format!(
                "registration ttl for {} must be positive",
                component
            )));
        }

        let unique_id = self
            .backend
            .incr(&node_id_key(component))
            .await
            .inspect_err(|e| {
                error!(component = %component, error = %e, "Failed to allocate node id");
            })?;

        if options.isolate {
            info!(
                component = %component,
                unique_id,
                "Node id allocated (isolated, not published)"
            );
            return Ok(unique_id);
        }

        let node = NodeInfo::new(component, address, unique_id, ttl)
            .with_sub_services(&options.sub_services);
        let value = node.encode()?;
        let key = service_key(component, address);

        self.backend
            .keep_alive(&key, &value, ttl)
            .await
            .inspect_err(|e| {
                error!(key = %key, error = %e, "Failed to publish registration");
            })?;

        info!(
            component = %component,
            address = %address,
            unique_id,
            ttl_ms = ttl.as_millis() as u64,
            sub_services = ?options.sub_services,
            "Node registered"
        );

        self.local.insert(component.to_string(), node);
        Ok(unique_id)
    }

    /// 注销组件节点，删除注册键并停止续约
    pub async fn unregister(&self, component: &str) -> Result<Option<NodeInfo>> {
        let Some((_, node)) = self.local.remove(component) else {
            return Ok(None);
        };

        let key = service_key(&node.service, &node.address);
        self.backend.delete(&key).await?;
        info!(component = %component, address = %node.address, "Node unregistered");
        Ok(Some(node))
    }

    /// 本进程注册的组件节点
    pub fn registered_node(&self, component: &str) -> Option<NodeInfo> {
        self.local.get(component).map(|e| e.value().clone())
    }

    /// 本进程注册的所有节点
    pub fn registered_nodes(&self) -> Vec<NodeInfo> {
        self.local.iter().map(|e| e.value().clone()).collect()
    }
}
