//! 节点信息与键布局
//!
//! 键布局：
//! - `service/<component>/<address>` → JSON 编码的 [`NodeInfo`]
//! - `node_id/<component>` → 后端计数器

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;

/// 服务注册键前缀
pub const SERVICE_PREFIX: &str = "service/";

/// 节点 ID 计数器键前缀
pub const NODE_ID_PREFIX: &str = "node_id/";

/// 元数据中记录子服务列表（逗号分隔）的键
pub const SUB_SERVICES_KEY: &str = "sub_services";

/// 组件的注册键：`service/<component>/<address>`
pub fn service_key(component: &str, address: &str) -> String {
    format!("{}{}/{}", SERVICE_PREFIX, component, address)
}

/// 组件下所有节点的键前缀：`service/<component>/`
pub fn service_prefix(component: &str) -> String {
    format!("{}{}/", SERVICE_PREFIX, component)
}

/// 组件的 ID 计数器键：`node_id/<component>`
pub fn node_id_key(component: &str) -> String {
    format!("{}{}", NODE_ID_PREFIX, component)
}

/// 从注册键中提取服务名（前缀之后的第一段）
pub fn service_name_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    let name = rest.split('/').next()?;
    if name.is_empty() { None } else { Some(name) }
}

/// 一个已注册的组件实例
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    /// 未续约时的过期时间
    #[serde(rename = "ttl_ms", with = "duration_millis")]
    pub ttl: Duration,

    /// 组件内单调递增的唯一 ID
    pub unique_id: i64,

    /// 组件名
    pub service: String,

    /// 可拨号的地址
    pub address: String,

    /// 元数据
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl NodeInfo {
    /// 创建新的节点信息
    pub fn new(
        service: impl Into<String>,
        address: impl Into<String>,
        unique_id: i64,
        ttl: Duration,
    ) -> Self {
        Self {
            ttl,
            unique_id,
            service: service.into(),
            address: address.into(),
            metadata: HashMap::new(),
        }
    }

    /// 设置子服务列表
    pub fn with_sub_services<I, S>(mut self, sub_services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = sub_services
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(",");
        if joined.is_empty() {
            self.metadata.remove(SUB_SERVICES_KEY);
        } else {
            self.metadata.insert(SUB_SERVICES_KEY.to_string(), joined);
        }
        self
    }

    /// 添加元数据
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 节点声明的子服务
    pub fn sub_services(&self) -> Vec<&str> {
        self.metadata
            .get(SUB_SERVICES_KEY)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 是否提供指定子服务
    pub fn serves(&self, sub_service: &str) -> bool {
        self.sub_services().contains(&sub_service)
    }

    /// 编码为 JSON
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 从 JSON 解码
    pub fn decode(value: &str) -> Result<Self> {
        Ok(serde_json::from_str(value)?)
    }
}

/// 注册选项
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// 只分配 ID，不发布注册信息
    pub isolate: bool,
    /// 注册 TTL，未设置时使用配置中的默认值
    pub ttl: Option<Duration>,
    /// 额外提供的子服务
    pub sub_services: Vec<String>,
}

impl RegisterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 只分配 ID，不可被发现
    pub fn isolate(mut self) -> Self {
        self.isolate = true;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_sub_service(mut self, sub_service: impl Into<String>) -> Self {
        self.sub_services.push(sub_service.into());
        self
    }

    pub fn with_sub_services<I, S>(mut self, sub_services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sub_services
            .extend(sub_services.into_iter().map(Into::into));
        self
    }
}

/// TTL 以毫秒编码
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
