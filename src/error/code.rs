//! 错误代码和错误类别定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误代码枚举
///
/// 错误代码按类别分组，每个类别占用1000个代码范围：
/// - 1000-1999: 连接相关错误
/// - 2000-2999: 服务发现相关错误
/// - 3000-3999: 后端存储相关错误
/// - 6000-6999: 系统相关错误
/// - 8000-8999: 序列化相关错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 连接相关错误 (1000-1999)
    // ============================================================
    ConnectionFailed = 1000,
    NoConnectionAvailable = 1001,

    // ============================================================
    // 服务发现相关错误 (2000-2999)
    // ============================================================
    ServiceUnavailable = 2000,
    InvalidTarget = 2001,

    // ============================================================
    // 后端存储相关错误 (3000-3999)
    // ============================================================
    BackendError = 3000,
    BackendClosed = 3001,
    WatchFailed = 3002,

    // ============================================================
    // 系统相关错误 (6000-6999)
    // ============================================================
    ConfigurationError = 6000,

    // ============================================================
    // 序列化相关错误 (8000-8999)
    // ============================================================
    CodecError = 8000,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ErrorCode {
    /// 获取错误代码的数字值
    #[inline]
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// 从数字值创建错误代码
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1000 => Some(ErrorCode::ConnectionFailed),
            1001 => Some(ErrorCode::NoConnectionAvailable),
            2000 => Some(ErrorCode::ServiceUnavailable),
            2001 => Some(ErrorCode::InvalidTarget),
            3000 => Some(ErrorCode::BackendError),
            3001 => Some(ErrorCode::BackendClosed),
            3002 => Some(ErrorCode::WatchFailed),
            6000 => Some(ErrorCode::ConfigurationError),
            8000 => Some(ErrorCode::CodecError),
            _ => None,
        }
    }

    /// 获取错误代码的英文标识符
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::NoConnectionAvailable => "NO_CONNECTION_AVAILABLE",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::InvalidTarget => "INVALID_TARGET",
            ErrorCode::BackendError => "BACKEND_ERROR",
            ErrorCode::BackendClosed => "BACKEND_CLOSED",
            ErrorCode::WatchFailed => "WATCH_FAILED",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::CodecError => "CODEC_ERROR",
        }
    }

    /// 获取错误代码的类别
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorCode::ConnectionFailed | ErrorCode::NoConnectionAvailable => ErrorCategory::Connection,
            ErrorCode::ServiceUnavailable | ErrorCode::InvalidTarget => ErrorCategory::Discovery,
            ErrorCode::BackendError | ErrorCode::BackendClosed | ErrorCode::WatchFailed => {
                ErrorCategory::Backend
            }
            ErrorCode::ConfigurationError => ErrorCategory::System,
            ErrorCode::CodecError => ErrorCategory::Serialization,
        }
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionFailed
                | ErrorCode::NoConnectionAvailable
                | ErrorCode::ServiceUnavailable
        )
    }
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Connection,
    Discovery,
    Backend,
    System,
    Serialization,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Connection => write!(f, "CONNECTION"),
            ErrorCategory::Discovery => write!(f, "DISCOVERY"),
            ErrorCategory::Backend => write!(f, "BACKEND"),
            ErrorCategory::System => write!(f, "SYSTEM"),
            ErrorCategory::Serialization => write!(f, "SERIALIZATION"),
        }
    }
}
