//! # settings：不可变的连接配置快照
//!
//! ## 设计动机（Why）
//! - 连接一旦创建，重连上限、延迟、各类超时与重试策略就不应再变化；控制器、队列与发现模块
//!   共享同一个 `Arc<ConnectionSettings>`，读路径无锁；
//! - 构建器方法名沿用事件存储客户端常见的动词短语（`limit_reconnections_to`、`keep_retrying` 等），
//!   让调用方可以直接对照服务端文档配置。
//!
//! ## 核心契约（What）
//! - [`Limit`] 统一表达“有限次数 / 无限”两种策略；
//! - [`ConnectionSettingsBuilder::build`] 负责校验：操作超时、检查周期、心跳间隔、队列容量、
//!   并发上限均不得为零；
//! - 结构体实现 `Serialize`/`Deserialize`，缺失字段回落到默认值，时长字段以毫秒整数表示。
//!
//! ## 风险与考量（Trade-offs）
//! - 重连延迟允许为零，此时失败后立即发起下一轮尝试；搭配 `keep_reconnecting` 在服务端长时间
//!   不可用时会形成紧密循环，生产环境应保留非零延迟。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::UserCredentials;

/// 次数上限：有限或无限。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    Finite(u32),
    Unlimited,
}

impl Limit {
    /// 已用次数 `used` 是否已经用尽预算（即不允许再来一次）。
    pub fn is_exhausted_by(self, used: u32) -> bool {
        match self {
            Limit::Finite(max) => used >= max,
            Limit::Unlimited => false,
        }
    }

    /// 计数 `count` 是否已超过上限。
    pub fn is_exceeded_by(self, count: u32) -> bool {
        match self {
            Limit::Finite(max) => count > max,
            Limit::Unlimited => false,
        }
    }

    /// 连接串中的整数表示：负数代表无限。
    pub fn from_signed(raw: i64) -> Self {
        if raw < 0 {
            Limit::Unlimited
        } else {
            Limit::Finite(u32::try_from(raw).unwrap_or(u32::MAX))
        }
    }
}

/// 集群发现时的节点偏好。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodePreference {
    #[default]
    Leader,
    Follower,
    ReadOnlyReplica,
}

/// 配置校验与连接串解析错误。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum SettingsError {
    #[error("`{field}` must be greater than zero")]
    MustBePositive { field: &'static str },

    #[error("invalid endpoint `{value}`, expected host:port")]
    InvalidEndpoint { value: String },

    #[error("connection string segment `{segment}` is not a Key=Value pair")]
    MalformedSegment { segment: String },

    #[error("unknown connection string key `{key}`")]
    UnknownKey { key: String },

    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: String, value: String },

    #[error("connection string names no target (ConnectTo, GossipSeeds or ClusterDns)")]
    MissingTarget,

    #[error("no connector configured for the connection")]
    MissingConnector,

    #[error("cluster target `{target}` requires a gossip client")]
    MissingGossipClient { target: String },
}

/// 不可变配置快照。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub max_reconnections: Limit,
    #[serde(with = "duration_ms")]
    pub reconnection_delay: Duration,
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,
    pub max_retries: Limit,
    #[serde(with = "duration_ms")]
    pub operation_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub operation_timeout_check_period: Duration,
    pub fail_on_no_server_response: bool,
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_ms")]
    pub heartbeat_timeout: Duration,
    pub use_tls: bool,
    pub tls_target_host: Option<String>,
    pub validate_server_certificate: bool,
    pub max_queue_size: usize,
    pub max_concurrent_items: usize,
    pub require_leader: bool,
    pub default_credentials: Option<UserCredentials>,
    pub max_discover_attempts: u32,
    #[serde(with = "duration_ms")]
    pub gossip_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub discover_attempt_delay: Duration,
    pub node_preference: NodePreference,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_reconnections: Limit::Finite(10),
            reconnection_delay: Duration::from_millis(100),
            connection_timeout: Duration::from_secs(1),
            max_retries: Limit::Finite(10),
            operation_timeout: Duration::from_secs(7),
            operation_timeout_check_period: Duration::from_secs(1),
            fail_on_no_server_response: false,
            heartbeat_interval: Duration::from_millis(750),
            heartbeat_timeout: Duration::from_millis(1500),
            use_tls: false,
            tls_target_host: None,
            validate_server_certificate: true,
            max_queue_size: 5000,
            max_concurrent_items: 5000,
            require_leader: true,
            default_credentials: None,
            max_discover_attempts: 10,
            gossip_timeout: Duration::from_secs(1),
            discover_attempt_delay: Duration::from_millis(500),
            node_preference: NodePreference::Leader,
        }
    }
}

impl ConnectionSettings {
    pub fn builder() -> ConnectionSettingsBuilder {
        ConnectionSettingsBuilder::default()
    }

    /// 校验不变量，供构建器与反序列化后的快照复用。
    pub fn validate(&self) -> Result<(), SettingsError> {
        let positive_durations = [
            ("operation_timeout", self.operation_timeout),
            (
                "operation_timeout_check_period",
                self.operation_timeout_check_period,
            ),
            ("heartbeat_interval", self.heartbeat_interval),
            ("connection_timeout", self.connection_timeout),
        ];
        for (field, value) in positive_durations {
            if value.is_zero() {
                return Err(SettingsError::MustBePositive { field });
            }
        }
        if self.max_queue_size == 0 {
            return Err(SettingsError::MustBePositive {
                field: "max_queue_size",
            });
        }
        if self.max_concurrent_items == 0 {
            return Err(SettingsError::MustBePositive {
                field: "max_concurrent_items",
            });
        }
        if self.max_discover_attempts == 0 {
            return Err(SettingsError::MustBePositive {
                field: "max_discover_attempts",
            });
        }
        Ok(())
    }
}

/// 流式构建器。
#[derive(Clone, Debug, Default)]
pub struct ConnectionSettingsBuilder {
    settings: ConnectionSettings,
}

impl ConnectionSettingsBuilder {
    pub fn limit_reconnections_to(mut self, limit: u32) -> Self {
        self.settings.max_reconnections = Limit::Finite(limit);
        self
    }

    pub fn keep_reconnecting(mut self) -> Self {
        self.settings.max_reconnections = Limit::Unlimited;
        self
    }

    pub fn set_reconnection_delay_to(mut self, delay: Duration) -> Self {
        self.settings.reconnection_delay = delay;
        self
    }

    pub fn with_connection_timeout_of(mut self, timeout: Duration) -> Self {
        self.settings.connection_timeout = timeout;
        self
    }

    pub fn limit_retries_for_operation_to(mut self, limit: u32) -> Self {
        self.settings.max_retries = Limit::Finite(limit);
        self
    }

    pub fn keep_retrying(mut self) -> Self {
        self.settings.max_retries = Limit::Unlimited;
        self
    }

    pub fn set_operation_timeout_to(mut self, timeout: Duration) -> Self {
        self.settings.operation_timeout = timeout;
        self
    }

    pub fn set_timeout_check_period_to(mut self, period: Duration) -> Self {
        self.settings.operation_timeout_check_period = period;
        self
    }

    /// 操作在超时内无应答时，视链路为失联并触发重连。
    pub fn fail_on_no_server_response(mut self) -> Self {
        self.settings.fail_on_no_server_response = true;
        self
    }

    pub fn set_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.settings.heartbeat_interval = interval;
        self
    }

    pub fn set_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.settings.heartbeat_timeout = timeout;
        self
    }

    pub fn use_tls(mut self, enabled: bool) -> Self {
        self.settings.use_tls = enabled;
        self
    }

    pub fn set_tls_target_host(mut self, host: impl Into<String>) -> Self {
        self.settings.tls_target_host = Some(host.into());
        self
    }

    pub fn disable_server_certificate_validation(mut self) -> Self {
        self.settings.validate_server_certificate = false;
        self
    }

    pub fn limit_operations_queue_to(mut self, size: usize) -> Self {
        self.settings.max_queue_size = size;
        self
    }

    pub fn limit_concurrent_operations_to(mut self, limit: usize) -> Self {
        self.settings.max_concurrent_items = limit;
        self
    }

    pub fn perform_on_any_node(mut self) -> Self {
        self.settings.require_leader = false;
        self
    }

    pub fn perform_on_leader_only(mut self) -> Self {
        self.settings.require_leader = true;
        self
    }

    pub fn set_default_user_credentials(mut self, credentials: UserCredentials) -> Self {
        self.settings.default_credentials = Some(credentials);
        self
    }

    pub fn set_max_discover_attempts(mut self, attempts: u32) -> Self {
        self.settings.max_discover_attempts = attempts;
        self
    }

    pub fn set_gossip_timeout(mut self, timeout: Duration) -> Self {
        self.settings.gossip_timeout = timeout;
        self
    }

    pub fn set_discover_attempt_delay(mut self, delay: Duration) -> Self {
        self.settings.discover_attempt_delay = delay;
        self
    }

    pub fn prefer_leader_node(mut self) -> Self {
        self.settings.node_preference = NodePreference::Leader;
        self
    }

    pub fn prefer_follower_node(mut self) -> Self {
        self.settings.node_preference = NodePreference::Follower;
        self
    }

    pub fn prefer_read_only_replica(mut self) -> Self {
        self.settings.node_preference = NodePreference::ReadOnlyReplica;
        self
    }

    pub fn build(self) -> Result<ConnectionSettings, SettingsError> {
        self.settings.validate()?;
        Ok(self.settings)
    }

    pub(crate) fn settings_mut(&mut self) -> &mut ConnectionSettings {
        &mut self.settings
    }
}

/// 时长字段以毫秒整数序列化。
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_reconnection_and_retry_policies() {
        let settings = ConnectionSettings::builder()
            .limit_reconnections_to(0)
            .set_reconnection_delay_to(Duration::ZERO)
            .with_connection_timeout_of(Duration::from_secs(10))
            .keep_retrying()
            .fail_on_no_server_response()
            .use_tls(true)
            .disable_server_certificate_validation()
            .build()
            .expect("合法配置应构建成功");

        assert_eq!(settings.max_reconnections, Limit::Finite(0));
        assert_eq!(settings.reconnection_delay, Duration::ZERO);
        assert_eq!(settings.max_retries, Limit::Unlimited);
        assert!(settings.fail_on_no_server_response);
        assert!(settings.use_tls);
        assert!(!settings.validate_server_certificate);
    }

    #[test]
    fn build_rejects_zero_operation_timeout() {
        let err = ConnectionSettings::builder()
            .set_operation_timeout_to(Duration::ZERO)
            .build()
            .expect_err("零操作超时必须被拒绝");
        assert_eq!(
            err,
            SettingsError::MustBePositive {
                field: "operation_timeout"
            }
        );
    }

    #[test]
    fn limit_semantics() {
        assert!(Limit::Finite(0).is_exceeded_by(1));
        assert!(!Limit::Finite(1).is_exceeded_by(1));
        assert!(Limit::Finite(2).is_exhausted_by(2));
        assert!(!Limit::Unlimited.is_exhausted_by(u32::MAX));
        assert_eq!(Limit::from_signed(-1), Limit::Unlimited);
    }
}
