//! 错误类型转换实现

use super::DiscoveryError;

impl From<serde_json::Error> for DiscoveryError {
    fn from(err: serde_json::Error) -> Self {
        DiscoveryError::Codec(format!("JSON 编解码错误: {}", err))
    }
}

#[cfg(feature = "etcd")]
impl From<etcd_client::Error> for DiscoveryError {
    fn from(err: etcd_client::Error) -> Self {
        DiscoveryError::backend("etcd", err.to_string())
    }
}
