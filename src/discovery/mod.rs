//! 服务发现
//!
//! 后端抽象、节点布局、成员缓存和解析桥接。

pub mod backend;
pub mod cache;
pub mod factory;
pub mod node;
pub mod resolver;

pub use backend::{Backend, KvPair, KvPairs, MemoryBackend, WatchEvent, WatchReceiver};
#[cfg(feature = "etcd")]
pub use backend::EtcdBackend;
pub use cache::{AddressListener, MembershipCache};
pub use factory::Discovery;
pub use node::{NodeInfo, RegisterOptions};
pub use resolver::{BalanceChannelState, ClientConnState, Resolver, ResolverBuilder, Target};
