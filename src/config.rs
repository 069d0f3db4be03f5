//! 服务发现配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DiscoveryError, Result};

/// 默认解析 scheme
pub const DEFAULT_SCHEME: &str = "discovery";

/// 服务发现配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    /// 后端类型：etcd, memory
    #[serde(default)]
    pub backend: BackendType,

    /// 后端地址列表（etcd endpoints）
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// 注册 TTL（秒）
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// 解析 scheme
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// 监听流断开后重新监听的间隔（毫秒）
    #[serde(default = "default_watch_retry_interval_ms")]
    pub watch_retry_interval_ms: u64,

    /// 连接池配置
    #[serde(default)]
    pub pool: PoolConfig,

    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

fn default_ttl_secs() -> u64 {
    60
}

fn default_scheme() -> String {
    DEFAULT_SCHEME.to_string()
}

fn default_watch_retry_interval_ms() -> u64 {
    1000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            ttl_secs: default_ttl_secs(),
            scheme: default_scheme(),
            watch_retry_interval_ms: default_watch_retry_interval_ms(),
            pool: PoolConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl DiscoveryConfig {
    /// 创建默认配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 文件加载配置，并应用环境变量覆盖
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    /// 从 TOML 字符串解析配置，并应用环境变量覆盖
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: DiscoveryConfig =
            toml::from_str(content).map_err(|e| DiscoveryError::Config(e.to_string()))?;
        let config = config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// 应用环境变量覆盖
    ///
    /// - `DISCOVERY_TTL_SECONDS`: 注册 TTL
    /// - `ETCD_ENDPOINTS`: 逗号分隔的 etcd 地址
    pub fn apply_env(mut self) -> Self {
        if let Some(ttl) = std::env::var("DISCOVERY_TTL_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.ttl_secs = ttl;
        }
        if let Ok(endpoints) = std::env::var("ETCD_ENDPOINTS") {
            let endpoints: Vec<String> = endpoints
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !endpoints.is_empty() {
                self.endpoints = endpoints;
            }
        }
        self
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.ttl_secs == 0 {
            return Err(DiscoveryError::Config("ttl_secs must be positive".to_string()));
        }
        if self.scheme.is_empty() {
            return Err(DiscoveryError::Config("scheme must not be empty".to_string()));
        }
        if self.backend == BackendType::Etcd && self.endpoints.is_empty() {
            return Err(DiscoveryError::Config(
                "etcd backend requires at least one endpoint".to_string(),
            ));
        }
        self.pool.validate()
    }

    /// 设置后端类型
    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    /// 设置后端地址
    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// 设置 TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = ttl.as_secs().max(1);
        self
    }

    /// 设置 scheme
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// 设置监听重试间隔
    pub fn with_watch_retry_interval(mut self, interval: Duration) -> Self {
        self.watch_retry_interval_ms = interval.as_millis() as u64;
        self
    }

    /// 设置连接池配置
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// 注册 TTL
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// 监听重试间隔
    pub fn watch_retry_interval(&self) -> Duration {
        Duration::from_millis(self.watch_retry_interval_ms)
    }
}

/// 续约间隔下限
pub const MIN_KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(10);

/// 根据 TTL 计算续约间隔（TTL 的 1/3，至少 10 毫秒）
///
/// 间隔总是小于 TTL，续约会在过期之前发生。
pub fn keep_alive_interval_for(ttl: Duration) -> Duration {
    (ttl / 3).max(MIN_KEEP_ALIVE_INTERVAL)
}

/// 后端类型
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    #[default]
    Etcd,
    Memory,
}

impl std::str::FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "etcd" | "etcd3" => Ok(BackendType::Etcd),
            "memory" | "mem" | "debug" => Ok(BackendType::Memory),
            _ => Err(format!("Unknown backend type: {}", s)),
        }
    }
}

/// 连接池配置
///
/// 退避参数为固定配置，所有拨号共享同一策略
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// 首次重试延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大重试延迟（毫秒）
    pub max_delay_ms: u64,
    /// 退避倍数
    pub multiplier: f64,
    /// 随机抖动比例（0.0 - 1.0）
    pub jitter: f64,
    /// 最大拨号次数
    pub max_attempts: u32,
    /// 单次拨号超时（毫秒）
    pub connect_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 120_000,
            multiplier: 1.6,
            jitter: 0.2,
            max_attempts: 5,
            connect_timeout_ms: 20_000,
        }
    }
}

impl PoolConfig {
    /// 校验连接池配置
    pub fn validate(&self) -> Result<()> {
        if self.multiplier < 1.0 {
            return Err(DiscoveryError::Config("pool.multiplier must be >= 1.0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(DiscoveryError::Config("pool.jitter must be within [0, 1]".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(DiscoveryError::Config("pool.max_attempts must be positive".to_string()));
        }
        Ok(())
    }
}

/// 日志配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// 默认日志级别（RUST_LOG 优先）
    pub level: String,
    /// 是否输出 JSON 格式
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
