//! 客户端负载均衡
//!
//! [`Balancer`] 跟踪每个子连接的状态，就绪集合变化时重建轮询选择器。

pub mod picker;

pub use picker::{Picker, RoundRobinPicker};

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;

/// 子连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

struct SubConn<C> {
    conn: C,
    state: ConnectivityState,
}

/// 轮询负载均衡器
///
/// 子连接按地址排序，就绪集合每次变化都生成新的选择器快照。
pub struct Balancer<C> {
    sub_conns: Mutex<BTreeMap<String, SubConn<C>>>,
    picker: RwLock<Arc<RoundRobinPicker<C>>>,
}

impl<C: Clone + Send + Sync> Balancer<C> {
    pub fn new() -> Self {
        Self {
            sub_conns: Mutex::new(BTreeMap::new()),
            picker: RwLock::new(Arc::new(RoundRobinPicker::build(Vec::new()))),
        }
    }

    /// 更新子连接状态，就绪集合变化时重建选择器
    pub fn update_sub_conn_state(&self, address: &str, conn: C, state: ConnectivityState) {
        let mut sub_conns = self.sub_conns.lock();
        let was_ready = sub_conns
            .get(address)
            .is_some_and(|s| s.state == ConnectivityState::Ready);

        if state == ConnectivityState::Shutdown {
            sub_conns.remove(address);
        } else {
            sub_conns.insert(address.to_string(), SubConn { conn, state });
        }

        let is_ready = state == ConnectivityState::Ready;
        // 就绪连接被替换时也需要重建，快照里持有的是旧连接
        if was_ready || is_ready {
            self.regenerate(&sub_conns);
        }
    }

    /// 移除子连接
    pub fn remove_sub_conn(&self, address: &str) {
        let mut sub_conns = self.sub_conns.lock();
        if let Some(removed) = sub_conns.remove(address) {
            if removed.state == ConnectivityState::Ready {
                self.regenerate(&sub_conns);
            }
        }
    }

    /// 按新地址集合保留子连接，其余移除
    pub fn retain_addresses(&self, addresses: &[String]) {
        let mut sub_conns = self.sub_conns.lock();
        let before = sub_conns.len();
        sub_conns.retain(|address, _| addresses.contains(address));
        if sub_conns.len() != before {
            self.regenerate(&sub_conns);
        }
    }

    /// 当前选择器快照
    pub fn picker(&self) -> Arc<RoundRobinPicker<C>> {
        self.picker.read().clone()
    }

    /// 选择一个就绪连接
    pub fn pick(&self) -> Result<C> {
        self.picker().pick()
    }

    /// 就绪连接数
    pub fn ready_count(&self) -> usize {
        self.picker.read().len()
    }

    fn regenerate(&self, sub_conns: &BTreeMap<String, SubConn<C>>) {
        let ready: Vec<C> = sub_conns
            .values()
            .filter(|s| s.state == ConnectivityState::Ready)
            .map(|s| s.conn.clone())
            .collect();
        debug!(ready = ready.len(), "Rebuilding round-robin picker");
        *self.picker.write() = Arc::new(RoundRobinPicker::build(ready));
    }
}

impl<C: Clone + Send + Sync> Default for Balancer<C> {
    fn default() -> Self {
        Self::new()
    }
}
