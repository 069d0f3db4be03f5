//! 轮询选择器
//!
//! 构建时把就绪连接固定成有序快照，并随机选择起点，避免每次重建后
//! 流量都落在第一个连接上。之后每次选择只在锁内读取游标并前进一格。

use parking_lot::Mutex;
use rand::Rng;

use crate::error::{DiscoveryError, Result};

/// 连接选择器
pub trait Picker<C>: Send + Sync {
    /// 为下一次调用选择一个连接
    fn pick(&self) -> Result<C>;
}

/// 轮询选择器
///
/// 对同一快照的 N 个连接，连续 N 次选择恰好各命中一次。
/// 快照变化时应重建选择器，游标不跨快照保留。
pub struct RoundRobinPicker<C> {
    conns: Vec<C>,
    next: Mutex<usize>,
}

impl<C: Clone + Send + Sync> RoundRobinPicker<C> {
    /// 以随机起点构建
    ///
    /// 就绪集合为空时返回的选择器总是报错。
    pub fn build(ready: Vec<C>) -> Self {
        let start = if ready.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..ready.len())
        };
        Self::with_start(ready, start)
    }

    /// 以指定起点构建
    pub fn with_start(ready: Vec<C>, start: usize) -> Self {
        let start = if ready.is_empty() { 0 } else { start % ready.len() };
        Self {
            conns: ready,
            next: Mutex::new(start),
        }
    }

    /// 快照中的连接数
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

impl<C: Clone + Send + Sync> Picker<C> for RoundRobinPicker<C> {
    fn pick(&self) -> Result<C> {
        if self.conns.is_empty() {
            return Err(DiscoveryError::NoSubConnAvailable);
        }
        let mut next = self.next.lock();
        let conn = self.conns[*next].clone();
        *next = (*next + 1) % self.conns.len();
        Ok(conn)
    }
}
