//! 服务发现统一错误类型

use super::code::ErrorCode;
use thiserror::Error;

/// 服务发现统一错误类型
///
/// 每个变体都对应一个 [`ErrorCode`]，调用方通过模式匹配分类处理，
/// 而不是在运行时探测错误的具体形态。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// 后端存储错误（读写、计数器、租约等）
    #[error("后端错误 [{op}] {reason}")]
    Backend { op: &'static str, reason: String },

    /// 后端已关闭
    #[error("后端已关闭")]
    Closed,

    /// 监听注册或监听流失败
    #[error("监听失败 {key}: {reason}")]
    Watch { key: String, reason: String },

    /// 节点信息编解码失败
    #[error("编解码错误: {0}")]
    Codec(String),

    /// 解析结果为空，服务当前不可用
    #[error("服务不可用: {0}")]
    Unavailable(String),

    /// 没有可用的子连接
    #[error("没有可用的子连接")]
    NoSubConnAvailable,

    /// 目标地址格式错误
    #[error("无效的目标 {target}: {reason}")]
    InvalidTarget { target: String, reason: String },

    /// 建立连接失败
    #[error("连接 {target} 失败: {reason}")]
    Connect { target: String, reason: String },

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),
}

impl DiscoveryError {
    /// 创建后端错误
    pub fn backend(op: &'static str, reason: impl Into<String>) -> Self {
        DiscoveryError::Backend {
            op,
            reason: reason.into(),
        }
    }

    /// 创建监听错误
    pub fn watch(key: impl Into<String>, reason: impl Into<String>) -> Self {
        DiscoveryError::Watch {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// 创建服务不可用错误
    pub fn unavailable(service: impl Into<String>) -> Self {
        DiscoveryError::Unavailable(service.into())
    }

    /// 创建无效目标错误
    pub fn invalid_target(target: impl Into<String>, reason: impl Into<String>) -> Self {
        DiscoveryError::InvalidTarget {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// 创建连接失败错误
    pub fn connect(target: impl Into<String>, reason: impl Into<String>) -> Self {
        DiscoveryError::Connect {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            DiscoveryError::Backend { .. } => ErrorCode::BackendError,
            DiscoveryError::Closed => ErrorCode::BackendClosed,
            DiscoveryError::Watch { .. } => ErrorCode::WatchFailed,
            DiscoveryError::Codec(_) => ErrorCode::CodecError,
            DiscoveryError::Unavailable(_) => ErrorCode::ServiceUnavailable,
            DiscoveryError::NoSubConnAvailable => ErrorCode::NoConnectionAvailable,
            DiscoveryError::InvalidTarget { .. } => ErrorCode::InvalidTarget,
            DiscoveryError::Connect { .. } => ErrorCode::ConnectionFailed,
            DiscoveryError::Config(_) => ErrorCode::ConfigurationError,
        }
    }

    /// 是否为致命错误（进程无法继续运行）
    ///
    /// 目标格式错误与配置错误属于构造期错误，重试没有意义。
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DiscoveryError::InvalidTarget { .. } | DiscoveryError::Config(_)
        )
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, DiscoveryError>;
