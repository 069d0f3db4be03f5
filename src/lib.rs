//! Flare Discovery
//!
//! 基于带版本 KV 存储（etcd 或内存）的动态服务发现：节点注册与续约、
//! 成员缓存、gRPC 解析桥接、轮询负载均衡以及出站连接池。

pub mod balancer;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod registry;
pub mod retry;
pub mod telemetry;

pub use balancer::{Balancer, ConnectivityState, Picker, RoundRobinPicker};
pub use client::{ConnectionPool, Connector, TonicConnector};
pub use config::{BackendType, DiscoveryConfig, LogConfig, PoolConfig};
pub use discovery::{
    AddressListener, Backend, BalanceChannelState, ClientConnState, Discovery, KvPair, KvPairs,
    MembershipCache, MemoryBackend, NodeInfo, RegisterOptions, Resolver, ResolverBuilder, Target,
    WatchEvent, WatchReceiver,
};
#[cfg(feature = "etcd")]
pub use discovery::EtcdBackend;
pub use error::{DiscoveryError, ErrorCategory, ErrorCode, Result};
pub use registry::Registry;
pub use retry::{ExponentialBackoffPolicy, RetryPolicy};
