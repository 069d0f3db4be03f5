//! 出站连接池
//!
//! 按目标地址缓存已建立的连接，重复获取同一目标不会重新拨号。
//! 同一目标的并发首次获取可能各自拨号，映射中以最后写入者为准，
//! 多出来的连接只是浪费，并不影响正确性。

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tracing::{error, info, warn};

use crate::config::PoolConfig;
use crate::error::{DiscoveryError, Result};
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};

/// 连接器
///
/// 负责校验目标格式并建立单个连接
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Send + Sync + 'static;

    /// 校验目标格式，格式错误属于致命错误
    fn validate(&self, target: &str) -> Result<()>;

    /// 建立连接
    async fn connect(&self, target: &str) -> Result<Self::Connection>;

    /// 关闭连接，默认依赖 Drop
    fn disconnect(&self, _conn: &Self::Connection) {}
}

/// tonic Channel 连接器
#[derive(Debug, Clone)]
pub struct TonicConnector {
    connect_timeout: Duration,
}

impl TonicConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn endpoint(&self, target: &str) -> Result<Endpoint> {
        let uri = if target.contains("://") {
            target.to_string()
        } else {
            format!("http://{}", target)
        };
        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| DiscoveryError::invalid_target(target, format!("Invalid address: {}", e)))?;
        Ok(endpoint.connect_timeout(self.connect_timeout))
    }
}

#[async_trait]
impl Connector for TonicConnector {
    type Connection = Channel;

    fn validate(&self, target: &str) -> Result<()> {
        self.endpoint(target).map(|_| ())
    }

    async fn connect(&self, target: &str) -> Result<Channel> {
        let endpoint = self.endpoint(target)?;
        endpoint
            .connect()
            .await
            .map_err(|e| DiscoveryError::connect(target, format!("Failed to connect: {}", e)))
    }
}

/// 出站连接池
pub struct ConnectionPool<C: Connector = TonicConnector> {
    connector: C,
    backoff: ExponentialBackoffPolicy,
    conns: DashMap<String, Arc<C::Connection>>,
}

impl ConnectionPool<TonicConnector> {
    /// 使用 tonic 连接器创建连接池
    pub fn new(config: &PoolConfig) -> Self {
        Self::with_connector(
            TonicConnector::new(Duration::from_millis(config.connect_timeout_ms)),
            ExponentialBackoffPolicy::from(config),
        )
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// 使用自定义连接器创建连接池
    pub fn with_connector(connector: C, backoff: ExponentialBackoffPolicy) -> Self {
        Self {
            connector,
            backoff,
            conns: DashMap::new(),
        }
    }

    /// 获取目标的连接，未缓存时按退避策略拨号
    ///
    /// 目标格式错误返回致命错误（`is_fatal()`），调用方应终止进程。
    pub async fn get(&self, target: &str) -> Result<Arc<C::Connection>> {
        if let Some(conn) = self.conns.get(target) {
            return Ok(conn.value().clone());
        }

        if let Err(e) = self.connector.validate(target) {
            error!(target = %target, error = %e, "Fatal: invalid dial target");
            return Err(e);
        }

        let conn = Arc::new(self.dial(target).await?);
        self.conns.insert(target.to_string(), conn.clone());
        info!(target = %target, "Connection established");
        Ok(conn)
    }

    async fn dial(&self, target: &str) -> Result<C::Connection> {
        let max_attempts = self.backoff.max_attempts().max(1);
        let mut attempt = 0;
        loop {
            match self.connector.connect(target).await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        warn!(target = %target, attempts = attempt, error = %e, "Giving up dialing");
                        return Err(e);
                    }
                    let delay = self.backoff.backoff_duration(attempt - 1);
                    warn!(
                        target = %target,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Dial failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// 是否已缓存目标连接
    pub fn contains(&self, target: &str) -> bool {
        self.conns.contains_key(target)
    }

    /// 缓存的连接数
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// 关闭所有缓存的连接，仅用于进程关闭
    pub fn close(&self) {
        let targets: Vec<String> = self.conns.iter().map(|e| e.key().clone()).collect();
        for target in targets {
            if let Some((_, conn)) = self.conns.remove(&target) {
                self.connector.disconnect(&conn);
            }
        }
        info!("Connection pool closed");
    }
}
