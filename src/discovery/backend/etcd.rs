//! etcd 服务发现后端

use async_trait::async_trait;
use dashmap::DashMap;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, KeyValue, LeaseKeepAliveStream,
    LeaseKeeper, PutOptions, Txn, TxnOp, WatchOptions, WatchResponse,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Backend, KvPair, KvPairs, WatchEvent, WatchReceiver};
use crate::config::keep_alive_interval_for;
use crate::error::{DiscoveryError, Result};

/// 监听流断开后重新建立监听的间隔
const WATCH_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// 计数器 CAS 最大重试次数
const INCR_MAX_ATTEMPTS: usize = 64;

/// etcd 服务发现后端
pub struct EtcdBackend {
    client: Client,
    keepers: Arc<DashMap<String, CancellationToken>>,
    closed: CancellationToken,
}

impl EtcdBackend {
    /// 连接 etcd
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| DiscoveryError::backend("connect", format!("Failed to connect to etcd: {}", e)))?;

        info!(endpoints = ?endpoints, "etcd backend connected");

        Ok(Self {
            client,
            keepers: Arc::new(DashMap::new()),
            closed: CancellationToken::new(),
        })
    }

    /// 使用已有的客户端创建后端
    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            keepers: Arc::new(DashMap::new()),
            closed: CancellationToken::new(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            Err(DiscoveryError::Closed)
        } else {
            Ok(())
        }
    }

    /// 写入键值，ttl 非零时绑定到新租约，返回租约 ID
    async fn put_with_ttl(client: &mut Client, key: &str, value: &str, ttl: Duration) -> Result<Option<i64>> {
        if ttl.is_zero() {
            client.put(key, value, None).await?;
            return Ok(None);
        }

        // etcd 租约以秒为单位，向上取整
        let secs = (ttl.as_secs_f64().ceil() as i64).max(1);
        let lease = client.lease_grant(secs, None).await?;
        let lease_id = lease.id();
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease_id)))
            .await?;
        Ok(Some(lease_id))
    }

    async fn open_watch(
        client: &mut Client,
        key: &str,
        start_revision: i64,
        is_prefix: bool,
    ) -> Result<(etcd_client::Watcher, etcd_client::WatchStream)> {
        let mut opts = WatchOptions::new().with_start_revision(start_revision);
        if is_prefix {
            opts = opts.with_prefix();
        }
        client
            .watch(key, Some(opts))
            .await
            .map_err(|e| DiscoveryError::watch(key, e.to_string()))
    }
}

fn to_pair(kv: &KeyValue) -> Option<KvPair> {
    let key = kv.key_str().ok()?;
    let value = kv.value_str().unwrap_or_default();
    Some(KvPair::new(key, value, kv.mod_revision()))
}

/// 将 etcd 监听响应转换为事件，返回 `false` 表示需要重新建立监听
fn forward_events(
    resp: &WatchResponse,
    tx: &mpsc::UnboundedSender<WatchEvent>,
    next_revision: &mut i64,
) -> std::result::Result<bool, ()> {
    if resp.compact_revision() > 0 {
        // 请求的版本已被压缩，增量无法保证连续
        *next_revision = resp.compact_revision();
        tx.send(WatchEvent::Refresh).map_err(|_| ())?;
        return Ok(false);
    }
    if resp.canceled() {
        tx.send(WatchEvent::Refresh).map_err(|_| ())?;
        return Ok(false);
    }

    for event in resp.events() {
        let Some(pair) = event.kv().and_then(to_pair) else {
            continue;
        };
        *next_revision = pair.version + 1;
        let event = match event.event_type() {
            EventType::Put => WatchEvent::Update(pair),
            EventType::Delete => WatchEvent::Delete(pair),
        };
        tx.send(event).map_err(|_| ())?;
    }
    Ok(true)
}

#[async_trait]
impl Backend for EtcdBackend {
    fn backend_type(&self) -> &'static str {
        "etcd"
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        let mut client = self.client.clone();
        Self::put_with_ttl(&mut client, key, value, ttl).await?;
        Ok(())
    }

    async fn get(&self, key: &str, is_prefix: bool) -> Result<KvPairs> {
        self.ensure_open()?;
        let mut client = self.client.clone();
        let opts = if is_prefix {
            Some(GetOptions::new().with_prefix())
        } else {
            None
        };
        let resp = client.get(key, opts).await?;

        let version = resp.header().map(|h| h.revision()).unwrap_or_default();
        let pairs = resp.kvs().iter().filter_map(to_pair).collect();

        Ok(KvPairs { pairs, version })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        if let Some((_, keeper)) = self.keepers.remove(key) {
            keeper.cancel();
        }
        let mut client = self.client.clone();
        client.delete(key, None).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.ensure_open()?;
        let mut client = self.client.clone();

        for _ in 0..INCR_MAX_ATTEMPTS {
            let resp = client.get(key, None).await?;
            let (current, compare) = match resp.kvs().first() {
                Some(kv) => {
                    let current = kv
                        .value_str()
                        .ok()
                        .and_then(|v| v.parse::<i64>().ok())
                        .ok_or_else(|| {
                            DiscoveryError::backend("incr", format!("counter {} is not an integer", key))
                        })?;
                    (current, Compare::mod_revision(key, CompareOp::Equal, kv.mod_revision()))
                }
                None => (0, Compare::version(key, CompareOp::Equal, 0)),
            };

            let next = current + 1;
            let txn = Txn::new()
                .when(vec![compare])
                .and_then(vec![TxnOp::put(key, next.to_string(), None)]);
            if client.txn(txn).await?.succeeded() {
                return Ok(next);
            }
            debug!(key = %key, "counter CAS conflict, retrying");
        }

        Err(DiscoveryError::backend(
            "incr",
            format!("counter {} contended after {} attempts", key, INCR_MAX_ATTEMPTS),
        ))
    }

    async fn watch(&self, key: &str, from_version: i64, is_prefix: bool) -> Result<WatchReceiver> {
        self.ensure_open()?;
        let mut client = self.client.clone();
        let mut next_revision = from_version + 1;
        let first = Self::open_watch(&mut client, key, next_revision, is_prefix).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let closed = self.closed.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            let mut current = Some(first);
            loop {
                let (_watcher, mut stream) = match current.take() {
                    Some(pair) => pair,
                    None => {
                        tokio::select! {
                            _ = closed.cancelled() => return,
                            _ = tokio::time::sleep(WATCH_RETRY_INTERVAL) => {}
                        }
                        match Self::open_watch(&mut client, &key, next_revision, is_prefix).await {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(key = %key, error = %e, "Failed to re-open etcd watch");
                                continue;
                            }
                        }
                    }
                };

                loop {
                    let message = tokio::select! {
                        _ = closed.cancelled() => return,
                        message = stream.message() => message,
                    };
                    match message {
                        Ok(Some(resp)) => match forward_events(&resp, &tx, &mut next_revision) {
                            Ok(true) => {}
                            Ok(false) => break,
                            // 接收端已关闭
                            Err(()) => return,
                        },
                        Ok(None) => {
                            warn!(key = %key, "etcd watch stream closed");
                            break;
                        }
                        Err(e) => {
                            warn!(key = %key, error = %e, "etcd watch stream error");
                            break;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn keep_alive(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        let mut client = self.client.clone();
        let mut lease_id = Self::put_with_ttl(&mut client, key, value, ttl).await?;

        let token = self.closed.child_token();
        if let Some(previous) = self.keepers.insert(key.to_string(), token.clone()) {
            previous.cancel();
        }

        let key = key.to_string();
        let value = value.to_string();
        let interval = keep_alive_interval_for(ttl);

        tokio::spawn(async move {
            // 每个租约只打开一次 keeper/stream，之后每次续约复用
            let mut session: Option<(LeaseKeeper, LeaseKeepAliveStream)> = None;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let renewed = match lease_id {
                    Some(id) => {
                        if session.is_none() {
                            match client.lease_keep_alive(id).await {
                                Ok(pair) => session = Some(pair),
                                Err(e) => {
                                    warn!(key = %key, lease_id = id, error = %e, "Lease keep-alive failed");
                                }
                            }
                        }
                        match session.as_mut() {
                            Some((keeper, stream)) => match keeper.keep_alive().await {
                                Ok(()) => matches!(stream.message().await, Ok(Some(resp)) if resp.ttl() > 0),
                                Err(e) => {
                                    warn!(key = %key, lease_id = id, error = %e, "Lease keep-alive request failed");
                                    false
                                }
                            },
                            None => false,
                        }
                    }
                    None => true,
                };

                if !renewed {
                    session = None;
                    // 租约丢失，重新写入
                    match Self::put_with_ttl(&mut client, &key, &value, ttl).await {
                        Ok(id) => {
                            info!(key = %key, lease_id = ?id, "Registration re-written with new lease");
                            lease_id = id;
                        }
                        Err(e) => {
                            error!(key = %key, error = %e, "Failed to re-write registration");
                        }
                    }
                }
            }

            if let Some(id) = lease_id {
                if let Err(e) = client.lease_revoke(id).await {
                    debug!(key = %key, lease_id = id, error = %e, "Failed to revoke lease");
                }
            }
            debug!(key = %key, "etcd keep-alive stopped");
        });

        Ok(())
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.keepers.clear();
        info!("etcd backend closed");
    }
}
