//! 解析桥接
//!
//! 把服务名解析为成员缓存中的当前地址列表，供 RPC 客户端拉取；
//! 成员缓存变化时也会主动推送到相关的解析器。
//!
//! 目标支持 `component` 与 `component.sub_service` 两种写法，
//! 可带 scheme 前缀，例如 `discovery:///orders.billing`。

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tonic::transport::Endpoint;
use tower::discover::Change;
use tracing::{debug, warn};

use crate::discovery::cache::{AddressListener, MembershipCache};
use crate::error::{DiscoveryError, Result};

/// 解析目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: String,
    pub component: String,
    pub sub_service: Option<String>,
}

impl Target {
    /// 解析目标字符串
    ///
    /// 接受 `orders`、`orders.billing`、`discovery:orders`、`discovery:///orders.billing`，
    /// 不带 scheme 时使用默认 scheme。
    pub fn parse(target: &str, default_scheme: &str) -> Result<Self> {
        let (scheme, rest) = match target.split_once(':') {
            Some((scheme, rest)) => (scheme, rest.trim_start_matches('/')),
            None => (default_scheme, target),
        };

        if scheme != default_scheme {
            return Err(DiscoveryError::invalid_target(
                target,
                format!("unsupported scheme {:?}", scheme),
            ));
        }

        let (component, sub_service) = split_selector(rest);
        if component.is_empty() {
            return Err(DiscoveryError::invalid_target(target, "empty component name"));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            component: component.to_string(),
            sub_service: sub_service.map(str::to_string),
        })
    }

    /// 不带 scheme 的选择器：`component` 或 `component.sub_service`
    pub fn selector(&self) -> String {
        match &self.sub_service {
            Some(sub) => format!("{}.{}", self.component, sub),
            None => self.component.clone(),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:///{}", self.scheme, self.selector())
    }
}

fn split_selector(selector: &str) -> (&str, Option<&str>) {
    match selector.split_once('.') {
        Some((component, sub)) if !sub.is_empty() => (component, Some(sub)),
        Some((component, _)) => (component, None),
        None => (selector, None),
    }
}

/// 按选择器从成员缓存取地址
///
/// 带子服务时优先返回声明了该子服务的节点；一个都没有时回退为组件的全部节点，
/// 只要组件本身还活着就不返回空列表。
pub fn get_addresses(cache: &MembershipCache, selector: &str) -> Vec<String> {
    let (component, sub_service) = split_selector(selector);
    let Some(nodes) = cache.nodes(component) else {
        return Vec::new();
    };

    let mut all: Vec<String> = nodes.keys().cloned().collect();
    all.sort();

    let Some(sub_service) = sub_service else {
        return all;
    };

    let mut matched: Vec<String> = nodes
        .values()
        .filter(|node| node.serves(sub_service))
        .map(|node| node.address.clone())
        .collect();
    if matched.is_empty() {
        debug!(
            component = %component,
            sub_service = %sub_service,
            "No node advertises sub-service, falling back to component"
        );
        return all;
    }
    matched.sort();
    matched
}

/// 客户端连接状态
///
/// 由 RPC 层实现，接收解析结果或“不可用”通知。
pub trait ClientConnState: Send + Sync {
    /// 新的地址集合
    fn update_addresses(&self, addresses: Vec<String>);

    /// 解析失败（例如地址为空）
    fn report_error(&self, error: DiscoveryError);
}

struct ResolverInner {
    target: Target,
    cache: Arc<MembershipCache>,
    conn: Arc<dyn ClientConnState>,
}

impl ResolverInner {
    fn resolve_now(&self) {
        let selector = self.target.selector();
        let addresses = get_addresses(&self.cache, &selector);
        if addresses.is_empty() {
            warn!(target = %self.target, "No address available");
            self.conn.report_error(DiscoveryError::unavailable(selector));
        } else {
            debug!(target = %self.target, addresses = ?addresses, "Resolved");
            self.conn.update_addresses(addresses);
        }
    }
}

/// 解析器构建器
///
/// 注册为成员缓存的地址监听者，缓存变化时刷新所有指向该组件的解析器。
pub struct ResolverBuilder {
    scheme: String,
    cache: Arc<MembershipCache>,
    active: DashMap<u64, Arc<ResolverInner>>,
    next_id: AtomicU64,
}

impl ResolverBuilder {
    /// 创建构建器并注册到成员缓存
    pub fn new(cache: Arc<MembershipCache>, scheme: impl Into<String>) -> Arc<Self> {
        let builder = Arc::new(Self {
            scheme: scheme.into(),
            cache: cache.clone(),
            active: DashMap::new(),
            next_id: AtomicU64::new(1),
        });
        let weak: Weak<ResolverBuilder> = Arc::downgrade(&builder);
        let listener: Weak<dyn AddressListener> = weak;
        cache.set_listener(listener);
        builder
    }

    /// 解析 scheme
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// 按选择器取地址
    pub fn get_addresses(&self, selector: &str) -> Vec<String> {
        get_addresses(&self.cache, selector)
    }

    /// 为目标创建解析器并立即解析一次
    pub fn build(self: &Arc<Self>, target: &str, conn: Arc<dyn ClientConnState>) -> Result<Resolver> {
        let target = Target::parse(target, &self.scheme)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(ResolverInner {
            target,
            cache: self.cache.clone(),
            conn,
        });
        self.active.insert(id, inner.clone());
        inner.resolve_now();

        Ok(Resolver {
            id,
            inner,
            builder: Arc::downgrade(self),
        })
    }

    /// 活跃解析器数量
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

impl AddressListener for ResolverBuilder {
    fn on_addresses(&self, service: &str, _addresses: &[String]) {
        let affected: Vec<Arc<ResolverInner>> = self
            .active
            .iter()
            .filter(|e| e.value().target.component == service)
            .map(|e| e.value().clone())
            .collect();
        for resolver in affected {
            resolver.resolve_now();
        }
    }
}

/// 单个目标的解析器
pub struct Resolver {
    id: u64,
    inner: Arc<ResolverInner>,
    builder: Weak<ResolverBuilder>,
}

impl Resolver {
    /// 解析目标
    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    /// 立即解析并推送结果，可并发调用
    pub fn resolve_now(&self) {
        self.inner.resolve_now();
    }

    /// 释放解析器，之后不再接收缓存推送
    pub fn close(&self) {
        if let Some(builder) = self.builder.upgrade() {
            builder.active.remove(&self.id);
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.close();
    }
}

/// 将解析结果同步到 tonic balance channel
///
/// ```ignore
/// use flare_discovery::discovery::resolver::BalanceChannelState;
/// use std::sync::Arc;
/// use tonic::transport::Channel;
///
/// let (channel, tx) = Channel::balance_channel::<String>(1024);
/// let state = Arc::new(BalanceChannelState::new(tx));
/// // let resolver = builder.build("orders.billing", state)?;
/// // let client = OrdersClient::new(channel);
/// ```
pub struct BalanceChannelState {
    tx: mpsc::Sender<Change<String, Endpoint>>,
    current: Mutex<HashSet<String>>,
    last_error: Mutex<Option<DiscoveryError>>,
}

impl BalanceChannelState {
    pub fn new(tx: mpsc::Sender<Change<String, Endpoint>>) -> Self {
        Self {
            tx,
            current: Mutex::new(HashSet::new()),
            last_error: Mutex::new(None),
        }
    }

    /// 最近一次解析错误
    pub fn last_error(&self) -> Option<DiscoveryError> {
        self.last_error.lock().clone()
    }

    fn endpoint(address: &str) -> Option<Endpoint> {
        let uri = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        match Endpoint::from_shared(uri) {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                warn!(address = %address, error = %e, "Skipping invalid endpoint");
                None
            }
        }
    }

    fn send(&self, change: Change<String, Endpoint>) -> bool {
        match self.tx.try_send(change) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to push endpoint change");
                false
            }
        }
    }
}

impl ClientConnState for BalanceChannelState {
    fn update_addresses(&self, addresses: Vec<String>) {
        *self.last_error.lock() = None;
        let next: HashSet<String> = addresses.into_iter().collect();
        let mut current = self.current.lock();

        let removed: Vec<String> = current.difference(&next).cloned().collect();
        for address in removed {
            if self.send(Change::Remove(address.clone())) {
                current.remove(&address);
            }
        }

        let added: Vec<String> = next.difference(&current).cloned().collect();
        for address in added {
            if let Some(endpoint) = Self::endpoint(&address) {
                if self.send(Change::Insert(address.clone(), endpoint)) {
                    current.insert(address);
                }
            }
        }
    }

    fn report_error(&self, error: DiscoveryError) {
        // 保留已有端点，由 RPC 层的重试策略处理
        warn!(error = %error, "Resolution reported unavailable");
        *self.last_error.lock() = Some(error);
    }
}
