//! # protocol：会话上往返的消息模型
//!
//! ## 定位（Why）
//! - 核心引擎只关心“请求/应答”的语义，不关心字节布局；帧编码由传输实现负责；
//! - 统一的消息模型让内存模拟器与 TCP 实现可以共享同一套控制器逻辑。
//!
//! ## 契约（What）
//! - [`Request`] 与 [`Response`] 通过 [`CorrelationId`] 配对；同一会话内关联 ID 不重复；
//! - [`ExpectedVersion`] 的线上整数表示固定为 `Any = -2`、`NoStream = -1`、`StreamExists = -4`，
//!   精确版本为非负整数；传输编码必须遵守这一映射。

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::endpoint::Endpoint;

/// 请求与应答的关联标识。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 调用方对目标流当前版本的断言，用于乐观并发控制。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// 不做任何断言。
    Any,
    /// 断言流尚不存在。
    NoStream,
    /// 断言流已经存在（版本任意）。
    StreamExists,
    /// 断言流的最后一个事件编号恰好为该值。
    Exact(u64),
}

impl ExpectedVersion {
    const ANY: i64 = -2;
    const NO_STREAM: i64 = -1;
    const STREAM_EXISTS: i64 = -4;

    /// 线上整数表示。
    pub fn to_wire(self) -> i64 {
        match self {
            ExpectedVersion::Any => Self::ANY,
            ExpectedVersion::NoStream => Self::NO_STREAM,
            ExpectedVersion::StreamExists => Self::STREAM_EXISTS,
            ExpectedVersion::Exact(version) => i64::try_from(version).unwrap_or(i64::MAX),
        }
    }

    /// 从线上整数还原；未知的负值返回 `None`。
    pub fn from_wire(raw: i64) -> Option<Self> {
        match raw {
            Self::ANY => Some(ExpectedVersion::Any),
            Self::NO_STREAM => Some(ExpectedVersion::NoStream),
            Self::STREAM_EXISTS => Some(ExpectedVersion::StreamExists),
            version if version >= 0 => Some(ExpectedVersion::Exact(version as u64)),
            _ => None,
        }
    }

    /// 判断该断言在给定流状态下是否成立。
    pub fn matches(self, state: StreamState) -> bool {
        match (self, state) {
            (ExpectedVersion::Any, _) => true,
            (ExpectedVersion::NoStream, StreamState::NoStream) => true,
            (ExpectedVersion::StreamExists, StreamState::At(_)) => true,
            (ExpectedVersion::Exact(expected), StreamState::At(actual)) => expected == actual,
            _ => false,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("any"),
            ExpectedVersion::NoStream => f.write_str("no stream"),
            ExpectedVersion::StreamExists => f.write_str("stream exists"),
            ExpectedVersion::Exact(version) => write!(f, "{version}"),
        }
    }
}

/// 服务端报告的流当前状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    NoStream,
    At(u64),
}

impl StreamState {
    pub fn to_wire(self) -> i64 {
        match self {
            StreamState::NoStream => -1,
            StreamState::At(version) => i64::try_from(version).unwrap_or(i64::MAX),
        }
    }

    pub fn from_wire(raw: i64) -> Self {
        if raw < 0 {
            StreamState::NoStream
        } else {
            StreamState::At(raw as u64)
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::NoStream => f.write_str("no stream"),
            StreamState::At(version) => write!(f, "{version}"),
        }
    }
}

/// 待追加的单个事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventData {
    pub event_id: Uuid,
    pub event_type: String,
    pub is_json: bool,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl EventData {
    /// 以随机 ID 构造 JSON 事件。
    pub fn json(event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            is_json: true,
            data: data.into(),
            metadata: Bytes::new(),
        }
    }

    /// 以随机 ID 构造二进制事件。
    pub fn binary(event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            is_json: false,
            ..Self::json(event_type, data)
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn with_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }
}

/// 日志中的持久化位置。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Position {
    pub commit: u64,
    pub prepare: u64,
}

impl Position {
    pub const fn new(commit: u64, prepare: u64) -> Self {
        Self { commit, prepare }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C:{}/P:{}", self.commit, self.prepare)
    }
}

/// 一次成功追加的结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WriteResult {
    pub next_expected_version: u64,
    pub log_position: Position,
}

/// 透传给服务端的用户凭据；客户端不做任何校验。
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
}

impl UserCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// 追加请求体。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendRequest {
    pub stream: String,
    pub expected_version: ExpectedVersion,
    pub events: Vec<EventData>,
    pub require_leader: bool,
    pub credentials: Option<UserCredentials>,
}

/// 客户端发往服务端的消息。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub correlation: CorrelationId,
    pub body: RequestBody,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestBody {
    Append(AppendRequest),
    /// 客户端主动发出的心跳探测。
    HeartbeatRequest,
    /// 对服务端心跳探测的回应。
    HeartbeatResponse,
}

/// 服务端暂不处理请求的原因。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotHandledReason {
    NotReady,
    TooBusy,
    /// 当前节点不是 Leader；若已知则附带 Leader 的 TCP 端点。
    NotLeader { leader: Option<Endpoint> },
}

impl fmt::Display for NotHandledReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotHandledReason::NotReady => f.write_str("not ready"),
            NotHandledReason::TooBusy => f.write_str("too busy"),
            NotHandledReason::NotLeader { leader: Some(leader) } => {
                write!(f, "not leader, leader is {leader}")
            }
            NotHandledReason::NotLeader { leader: None } => f.write_str("not leader"),
        }
    }
}

/// 服务端发往客户端的消息。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub correlation: CorrelationId,
    pub body: ResponseBody,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseBody {
    AppendCompleted(WriteResult),
    WrongExpectedVersion { current: StreamState },
    StreamDeleted,
    AccessDenied,
    BadRequest { detail: String },
    NotHandled(NotHandledReason),
    HeartbeatResponse,
    /// 服务端主动发起的心跳探测，客户端需以同一关联 ID 回应。
    HeartbeatRequest,
}
