//! 轮询选择器与负载均衡器测试

use flare_discovery::{Balancer, ConnectivityState, DiscoveryError, Picker, RoundRobinPicker};
use std::collections::HashMap;
use std::sync::Arc;

/// 测试：N 次选择各命中一次，之后按相同顺序循环
#[test]
fn test_round_robin_fairness() {
    let conns = vec!["a", "b", "c", "d"];
    let picker = RoundRobinPicker::with_start(conns.clone(), 2);

    let first: Vec<&str> = (0..4).map(|_| picker.pick().expect("pick")).collect();
    assert_eq!(first, vec!["c", "d", "a", "b"]);

    let second: Vec<&str> = (0..4).map(|_| picker.pick().expect("pick")).collect();
    assert_eq!(first, second);
}

/// 测试：随机起点下每轮仍然各命中一次
#[test]
fn test_random_start_covers_all() {
    let picker = RoundRobinPicker::build(vec![1, 2, 3]);
    for _ in 0..5 {
        let mut round: Vec<i32> = (0..3).map(|_| picker.pick().expect("pick")).collect();
        round.sort();
        assert_eq!(round, vec![1, 2, 3]);
    }
}

/// 测试：空快照返回无可用子连接
#[test]
fn test_empty_picker_errors() {
    let picker: RoundRobinPicker<u32> = RoundRobinPicker::build(Vec::new());
    assert!(picker.is_empty());
    assert_eq!(picker.pick(), Err(DiscoveryError::NoSubConnAvailable));
}

/// 测试：多线程并发选择时总分布均匀
#[test]
fn test_concurrent_picks_balanced() {
    let picker = Arc::new(RoundRobinPicker::with_start(vec![0usize, 1, 2], 0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let picker = picker.clone();
            std::thread::spawn(move || {
                (0..300)
                    .map(|_| picker.pick().expect("pick"))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut counts: HashMap<usize, usize> = HashMap::new();
    for handle in handles {
        for conn in handle.join().expect("thread panicked") {
            *counts.entry(conn).or_default() += 1;
        }
    }
    assert_eq!(counts.values().copied().collect::<Vec<_>>(), vec![400; 3]);
}

/// 测试：就绪状态变化时重建选择器
#[test]
fn test_balancer_tracks_ready_sub_conns() {
    let balancer: Balancer<&str> = Balancer::new();
    assert_eq!(balancer.pick(), Err(DiscoveryError::NoSubConnAvailable));

    balancer.update_sub_conn_state("10.0.0.1:7000", "a", ConnectivityState::Connecting);
    assert_eq!(balancer.ready_count(), 0);

    balancer.update_sub_conn_state("10.0.0.1:7000", "a", ConnectivityState::Ready);
    balancer.update_sub_conn_state("10.0.0.2:7000", "b", ConnectivityState::Ready);
    assert_eq!(balancer.ready_count(), 2);

    let mut picked: Vec<&str> = (0..2).map(|_| balancer.pick().expect("pick")).collect();
    picked.sort();
    assert_eq!(picked, vec!["a", "b"]);

    balancer.update_sub_conn_state("10.0.0.1:7000", "a", ConnectivityState::TransientFailure);
    assert_eq!(balancer.ready_count(), 1);
    for _ in 0..3 {
        assert_eq!(balancer.pick(), Ok("b"));
    }

    balancer.update_sub_conn_state("10.0.0.2:7000", "b", ConnectivityState::Shutdown);
    assert_eq!(balancer.pick(), Err(DiscoveryError::NoSubConnAvailable));
}

/// 测试：旧的选择器快照不受重建影响
#[test]
fn test_picker_snapshot_is_stable() {
    let balancer: Balancer<&str> = Balancer::new();
    balancer.update_sub_conn_state("10.0.0.1:7000", "a", ConnectivityState::Ready);
    let snapshot = balancer.picker();

    balancer.remove_sub_conn("10.0.0.1:7000");
    assert_eq!(balancer.ready_count(), 0);
    assert_eq!(snapshot.pick(), Ok("a"));
}

/// 测试：按地址集合保留子连接
#[test]
fn test_retain_addresses() {
    let balancer: Balancer<&str> = Balancer::new();
    balancer.update_sub_conn_state("10.0.0.1:7000", "a", ConnectivityState::Ready);
    balancer.update_sub_conn_state("10.0.0.2:7000", "b", ConnectivityState::Ready);

    balancer.retain_addresses(&["10.0.0.2:7000".to_string()]);
    assert_eq!(balancer.ready_count(), 1);
    assert_eq!(balancer.pick(), Ok("b"));
}
