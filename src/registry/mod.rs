//! 服务注册模块

pub mod node_registry;

pub use node_registry::Registry;
