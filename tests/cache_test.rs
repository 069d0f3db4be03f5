//! 成员缓存测试

use async_trait::async_trait;
use flare_discovery::discovery::node::service_key;
use flare_discovery::error::Result;
use flare_discovery::{
    Backend, KvPair, KvPairs, MembershipCache, MemoryBackend, NodeInfo, RegisterOptions,
    Registry, WatchEvent, WatchReceiver,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

const RETRY: Duration = Duration::from_millis(20);

/// 轮询等待条件成立
async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn node_value(service: &str, address: &str, id: i64, sub_services: &[&str]) -> String {
    NodeInfo::new(service, address, id, Duration::from_secs(30))
        .with_sub_services(sub_services.iter().copied())
        .encode()
        .expect("encode node")
}

/// 测试：启动时加载已有节点
#[tokio::test]
async fn test_start_loads_existing_nodes() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = Registry::new(backend.clone(), Duration::from_secs(30));
    assert_ok!(registry.register("orders", "10.0.0.1:7000", RegisterOptions::new()).await);
    assert_ok!(registry.register("billing", "10.0.0.2:7000", RegisterOptions::new()).await);

    let cancel = CancellationToken::new();
    let (cache, task) = assert_ok!(MembershipCache::start(backend.clone(), RETRY, cancel.clone()).await);

    assert_eq!(cache.services(), vec!["billing", "orders"]);
    assert_eq!(cache.addresses("orders"), vec!["10.0.0.1:7000"]);

    cancel.cancel();
    assert_ok!(task.await);
}

/// 测试：新注册的节点通过监听进入缓存
#[tokio::test]
async fn test_watch_picks_up_new_nodes() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = Registry::new(backend.clone(), Duration::from_secs(30));
    let cancel = CancellationToken::new();
    let (cache, _task) = assert_ok!(MembershipCache::start(backend.clone(), RETRY, cancel.clone()).await);
    assert!(cache.services().is_empty());

    assert_ok!(registry.register("orders", "10.0.0.1:7000", RegisterOptions::new()).await);
    assert_ok!(registry.register("orders", "10.0.0.2:7000", RegisterOptions::new()).await);

    assert!(wait_until(|| cache.addresses("orders").len() == 2).await);
    assert_eq!(cache.addresses("orders"), vec!["10.0.0.1:7000", "10.0.0.2:7000"]);
    cancel.cancel();
}

/// 测试：删除节点后缓存收敛
#[tokio::test]
async fn test_delete_converges() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = Registry::new(backend.clone(), Duration::from_secs(30));
    assert_ok!(registry.register("orders", "10.0.0.1:7000", RegisterOptions::new()).await);

    let cancel = CancellationToken::new();
    let (cache, _task) = assert_ok!(MembershipCache::start(backend.clone(), RETRY, cancel.clone()).await);
    assert_eq!(cache.addresses("orders").len(), 1);

    assert_ok!(registry.unregister("orders").await);

    assert!(wait_until(|| cache.nodes("orders").is_none()).await);
    assert!(cache.services().is_empty());
    cancel.cancel();
}

/// 测试：同一键的连续更新以最后一次为准
#[tokio::test]
async fn test_updates_applied_in_order() {
    let backend = Arc::new(MemoryBackend::new());
    let cancel = CancellationToken::new();
    let (cache, _task) = assert_ok!(MembershipCache::start(backend.clone(), RETRY, cancel.clone()).await);

    let key = service_key("orders", "10.0.0.1:7000");
    let v1 = node_value("orders", "10.0.0.1:7000", 1, &["billing"]);
    let v2 = node_value("orders", "10.0.0.1:7000", 1, &["refund"]);
    assert_ok!(backend.set(&key, &v1, Duration::ZERO).await);
    assert_ok!(backend.set(&key, &v2, Duration::ZERO).await);

    assert!(
        wait_until(|| {
            cache
                .nodes("orders")
                .and_then(|nodes| nodes.get("10.0.0.1:7000").cloned())
                .is_some_and(|node| node.serves("refund"))
        })
        .await
    );
    let node = cache.nodes("orders").and_then(|n| n.get("10.0.0.1:7000").cloned());
    assert!(node.is_some_and(|n| !n.serves("billing")));
    cancel.cancel();
}

/// 测试：TTL 到期的节点从缓存中移除
#[tokio::test(start_paused = true)]
async fn test_expired_node_removed() {
    let backend = Arc::new(MemoryBackend::new());
    let cancel = CancellationToken::new();
    let (cache, _task) = assert_ok!(MembershipCache::start(backend.clone(), RETRY, cancel.clone()).await);

    let key = service_key("orders", "10.0.0.1:7000");
    let value = node_value("orders", "10.0.0.1:7000", 1, &[]);
    assert_ok!(backend.set(&key, &value, Duration::from_secs(3)).await);
    assert!(wait_until(|| cache.addresses("orders").len() == 1).await);

    tokio::time::advance(Duration::from_secs(4)).await;
    assert_eq!(backend.sweep_expired(), 1);

    assert!(wait_until(|| cache.nodes("orders").is_none()).await);
    cancel.cancel();
}

/// 测试：无法解码的节点被跳过
#[tokio::test]
async fn test_undecodable_node_skipped() {
    let backend = Arc::new(MemoryBackend::new());
    assert_ok!(backend.set(&service_key("orders", "bad"), "not-json", Duration::ZERO).await);
    assert_ok!(
        backend
            .set(
                &service_key("orders", "10.0.0.1:7000"),
                &node_value("orders", "10.0.0.1:7000", 1, &[]),
                Duration::ZERO,
            )
            .await
    );

    let cache = MembershipCache::new(backend.clone(), RETRY);
    assert_ok!(cache.get_services().await);
    assert_eq!(cache.addresses("orders"), vec!["10.0.0.1:7000"]);
}

/// 测试：取消后监听任务退出并关闭后端
#[tokio::test]
async fn test_cancel_stops_watch_and_closes_backend() {
    let backend = Arc::new(MemoryBackend::new());
    let cancel = CancellationToken::new();
    let (_cache, task) = assert_ok!(MembershipCache::start(backend.clone(), RETRY, cancel.clone()).await);
    assert_eq!(backend.watcher_count(), 1);

    cancel.cancel();
    assert_ok!(task.await);

    assert_eq!(backend.watcher_count(), 0);
    assert!(backend.get("service/", true).await.is_err());
}

/// 可编排的后端：查询结果由测试设置，监听通道由测试控制
#[derive(Default)]
struct ScriptedBackend {
    entries: Mutex<BTreeMap<String, String>>,
    version: Mutex<i64>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<WatchEvent>>>,
    watch_calls: AtomicUsize,
    /// 每次监听请求的起始版本
    watched_from: Mutex<Vec<i64>>,
}

impl ScriptedBackend {
    /// 修改数据但不产生监听事件
    fn put_silently(&self, key: &str, value: &str) {
        self.entries.lock().insert(key.to_string(), value.to_string());
        *self.version.lock() += 1;
    }

    fn remove_silently(&self, key: &str) {
        self.entries.lock().remove(key);
        *self.version.lock() += 1;
    }

    fn send(&self, event: WatchEvent) {
        for tx in self.watchers.lock().iter() {
            let _ = tx.send(event.clone());
        }
    }

    /// 关闭所有监听通道
    fn drop_watchers(&self) {
        self.watchers.lock().clear();
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn backend_type(&self) -> &'static str {
        "scripted"
    }

    async fn set(&self, key: &str, value: &str, _ttl: Duration) -> Result<()> {
        self.put_silently(key, value);
        Ok(())
    }

    async fn get(&self, key: &str, is_prefix: bool) -> Result<KvPairs> {
        let version = *self.version.lock();
        let pairs = self
            .entries
            .lock()
            .iter()
            .filter(|(k, _)| if is_prefix { k.starts_with(key) } else { k.as_str() == key })
            .map(|(k, v)| KvPair::new(k.as_str(), v.as_str(), version))
            .collect();
        Ok(KvPairs { pairs, version })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.remove_silently(key);
        Ok(())
    }

    async fn incr(&self, _key: &str) -> Result<i64> {
        Ok(1)
    }

    async fn watch(&self, _key: &str, from_version: i64, _is_prefix: bool) -> Result<WatchReceiver> {
        self.watched_from.lock().push(from_version);
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().push(tx);
        Ok(rx)
    }

    async fn keep_alive(&self, key: &str, value: &str, _ttl: Duration) -> Result<()> {
        self.put_silently(key, value);
        Ok(())
    }

    async fn close(&self) {
        self.drop_watchers();
    }
}

/// 测试：监听从全量加载时的版本开始，中间不留空档
#[tokio::test]
async fn test_watch_starts_at_listing_version() {
    let backend = Arc::new(ScriptedBackend::default());
    backend.put_silently(
        &service_key("orders", "10.0.0.1:7000"),
        &node_value("orders", "10.0.0.1:7000", 1, &[]),
    );
    backend.put_silently(
        &service_key("billing", "10.0.0.2:7000"),
        &node_value("billing", "10.0.0.2:7000", 1, &[]),
    );
    let listing_version = assert_ok!(backend.get("service/", true).await).version;
    assert_eq!(listing_version, 2);

    let cancel = CancellationToken::new();
    let (cache, _task) = assert_ok!(MembershipCache::start(backend.clone(), RETRY, cancel.clone()).await);

    assert_eq!(*backend.watched_from.lock(), vec![listing_version]);
    assert_eq!(assert_ok!(cache.get_services().await), listing_version);
    cancel.cancel();
}

/// 测试：Refresh 事件触发全量重载，漏掉的增删都能收敛
#[tokio::test]
async fn test_refresh_reloads_everything() {
    let backend = Arc::new(ScriptedBackend::default());
    backend.put_silently(
        &service_key("orders", "10.0.0.1:7000"),
        &node_value("orders", "10.0.0.1:7000", 1, &[]),
    );

    let cancel = CancellationToken::new();
    let (cache, _task) = assert_ok!(MembershipCache::start(backend.clone(), RETRY, cancel.clone()).await);
    assert_eq!(cache.services(), vec!["orders"]);

    // 监听没有投递的变化
    backend.remove_silently(&service_key("orders", "10.0.0.1:7000"));
    backend.put_silently(
        &service_key("billing", "10.0.0.2:7000"),
        &node_value("billing", "10.0.0.2:7000", 1, &[]),
    );
    assert_eq!(cache.services(), vec!["orders"]);

    backend.send(WatchEvent::Refresh);

    assert!(wait_until(|| cache.services() == vec!["billing".to_string()]).await);
    assert_eq!(cache.addresses("billing"), vec!["10.0.0.2:7000"]);
    cancel.cancel();
}

/// 测试：单个事件只重载对应服务
#[tokio::test]
async fn test_event_reloads_affected_service_only() {
    let backend = Arc::new(ScriptedBackend::default());
    let cancel = CancellationToken::new();
    let (cache, _task) = assert_ok!(MembershipCache::start(backend.clone(), RETRY, cancel.clone()).await);

    let orders_key = service_key("orders", "10.0.0.1:7000");
    backend.put_silently(&orders_key, &node_value("orders", "10.0.0.1:7000", 1, &[]));
    backend.put_silently(
        &service_key("billing", "10.0.0.2:7000"),
        &node_value("billing", "10.0.0.2:7000", 1, &[]),
    );

    backend.send(WatchEvent::Update(KvPair::new(orders_key, "", 1)));

    assert!(wait_until(|| cache.addresses("orders").len() == 1).await);
    assert!(cache.nodes("billing").is_none());
    cancel.cancel();
}

/// 测试：监听通道断开后重新加载并重新监听
#[tokio::test]
async fn test_watch_loss_recovers() {
    let backend = Arc::new(ScriptedBackend::default());
    let cancel = CancellationToken::new();
    let (cache, _task) = assert_ok!(MembershipCache::start(backend.clone(), RETRY, cancel.clone()).await);
    assert_eq!(backend.watch_calls.load(Ordering::SeqCst), 1);

    backend.put_silently(
        &service_key("orders", "10.0.0.1:7000"),
        &node_value("orders", "10.0.0.1:7000", 1, &[]),
    );
    backend.drop_watchers();

    assert!(wait_until(|| backend.watch_calls.load(Ordering::SeqCst) == 2).await);
    assert!(wait_until(|| cache.addresses("orders").len() == 1).await);
    // 重新监听从重新加载时的版本开始
    assert_eq!(*backend.watched_from.lock(), vec![0, 1]);
    cancel.cancel();
}
