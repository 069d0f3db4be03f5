//! 内存后端测试

use flare_discovery::{Backend, KvPair, MemoryBackend, WatchEvent};
use std::time::Duration;
use tokio_test::assert_ok;

/// 写入 `service/orders/a` 三次，版本依次为 1、2、3
async fn three_revisions(backend: &MemoryBackend) {
    for value in ["v1", "v2", "v3"] {
        assert_ok!(backend.set("service/orders/a", value, Duration::ZERO).await);
    }
    assert_eq!(backend.revision(), 3);
}

/// 测试：历史覆盖请求版本时按顺序回放之后的事件
#[tokio::test]
async fn test_watch_replays_history() {
    let backend = MemoryBackend::new();
    three_revisions(&backend).await;

    let mut rx = assert_ok!(backend.watch("service/", 1, true).await);
    assert_eq!(
        rx.try_recv().ok(),
        Some(WatchEvent::Update(KvPair::new("service/orders/a", "v2", 2)))
    );
    assert_eq!(
        rx.try_recv().ok(),
        Some(WatchEvent::Update(KvPair::new("service/orders/a", "v3", 3)))
    );
    assert!(rx.try_recv().is_err());
}

/// 测试：压缩后从更早版本监听先收到 Refresh，从压缩点监听只回放之后的版本
#[tokio::test]
async fn test_compacted_watch_sends_refresh() {
    let backend = MemoryBackend::new();
    three_revisions(&backend).await;

    backend.compact(2);

    let mut stale = assert_ok!(backend.watch("service/", 1, true).await);
    assert_eq!(stale.try_recv().ok(), Some(WatchEvent::Refresh));
    assert!(stale.try_recv().is_err());

    let mut fresh = assert_ok!(backend.watch("service/", 2, true).await);
    match fresh.try_recv() {
        Ok(WatchEvent::Update(kv)) => assert_eq!(kv.version, 3),
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(fresh.try_recv().is_err());

    // 之后的变化照常投递
    assert_ok!(backend.delete("service/orders/a").await);
    assert!(matches!(stale.try_recv(), Ok(WatchEvent::Delete(kv)) if kv.version == 4));
    assert!(matches!(fresh.try_recv(), Ok(WatchEvent::Delete(kv)) if kv.version == 4));
}

/// 测试：历史长度有限，超出后旧版本视为已压缩
#[tokio::test]
async fn test_bounded_history_compacts() {
    let backend = MemoryBackend::with_history_limit(2);
    three_revisions(&backend).await;

    let mut rx = assert_ok!(backend.watch("service/", 0, true).await);
    assert_eq!(rx.try_recv().ok(), Some(WatchEvent::Refresh));

    let mut rx = assert_ok!(backend.watch("service/", 1, true).await);
    assert!(matches!(rx.try_recv(), Ok(WatchEvent::Update(kv)) if kv.version == 2));
}

/// 测试：前缀监听只接收匹配的键
#[tokio::test]
async fn test_watch_filters_by_prefix() {
    let backend = MemoryBackend::new();
    let mut rx = assert_ok!(backend.watch("service/orders/", 0, true).await);

    assert_ok!(backend.set("service/billing/a", "x", Duration::ZERO).await);
    assert_ok!(backend.set("service/orders/a", "y", Duration::ZERO).await);

    assert!(matches!(rx.try_recv(), Ok(WatchEvent::Update(kv)) if kv.key == "service/orders/a"));
    assert!(rx.try_recv().is_err());
}

/// 测试：计数器从 1 开始递增
#[tokio::test]
async fn test_incr_counts_from_one() {
    let backend = MemoryBackend::new();
    assert_eq!(assert_ok!(backend.incr("node_id/orders").await), 1);
    assert_eq!(assert_ok!(backend.incr("node_id/orders").await), 2);

    assert_ok!(backend.set("node_id/bad", "abc", Duration::ZERO).await);
    assert!(backend.incr("node_id/bad").await.is_err());
}
