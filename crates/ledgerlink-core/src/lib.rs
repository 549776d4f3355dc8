//! # ledgerlink-core
//!
//! ## 定位与职责（Why）
//! - 面向追加写事件存储的客户端连接引擎：维护到单节点或集群的逻辑连接，
//!   在故障时透明重连，发现集群拓扑，并保证写操作在瞬时中断期间可靠送达；
//! - 引擎本身不包含任何套接字代码，物理链路通过 [`transport::Connector`] 注入，
//!   TCP/TLS 实现见 `ledgerlink-transport-tcp`。
//!
//! ## 架构嵌入（Where）
//! - `controller` 模块是唯一的状态所有者，以 actor 任务串行化全部状态迁移；
//! - `session` 与 `queue` 分别承载“当前链路”和“跨重连存活的写操作”；
//! - `discovery` 负责集群模式下的 gossip 查询与节点排序；
//! - `connection` 暴露给调用方的句柄与构建器。
//!
//! ## 保证（What）
//! - 操作不会被静默丢弃；成功确认的操作不会被再次投递；
//! - 已关闭的连接永不复活，后续调用一律返回 [`ConnectionError::Disposed`]；
//! - 同一流上的写按提交顺序发送，重连之后依然如此。
//!
//! ## Feature 策略（Trade-offs）
//! - `test-util` 对外开放内存集群模拟器，供集成测试与传输 crate 复用；生产构建无需开启。

pub mod connection;
pub mod connection_string;
pub mod controller;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod protocol;
mod queue;
mod session;
pub mod settings;
pub mod transport;

/// 内存集群与静态解析器，仅供测试使用。
#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use connection::{Connection, ConnectionBuilder};
pub use controller::ConnectionState;
pub use discovery::{ClusterDiscoverer, ClusterMember, GossipClient, NodeRole, select_best_member};
pub use endpoint::{
    ConnectTarget, DnsResolver, Endpoint, EndpointOrigin, EndpointResolver, ResolvedEndpoint,
};
pub use error::{ConnectionError, ErrorCategory, TransportErrorKind};
pub use events::{CloseReason, ConnectionEvent, ConnectionEventKind, HandlerId};
pub use protocol::{
    AppendRequest, CorrelationId, EventData, ExpectedVersion, NotHandledReason, Position, Request,
    RequestBody, Response, ResponseBody, StreamState, UserCredentials, WriteResult,
};
pub use settings::{
    ConnectionSettings, ConnectionSettingsBuilder, Limit, NodePreference, SettingsError,
};
pub use transport::{Connector, Link, LinkOptions, TlsOptions};
