//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为连接引擎对外暴露的全部失败语义提供集中定义：建连超时、发现耗尽、瞬时传输故障、
//!   乐观并发冲突、重试预算耗尽以及连接已销毁；
//! - 引擎内部依据 [`ErrorCategory`] 决定“吞下并重试”还是“立即交给调用方”，因此分类必须稳定。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，并实现 `Clone`，以便同一故障既能随生命周期事件广播，
//!   又能作为 [`ConnectionError::RetryExhausted`] 的 `last` 原因被保留；
//! - 瞬时故障（`Transient`/`Timeout`）只在内部消化，除非预算耗尽；冲突与销毁永远直达调用方。
//!
//! ## 扩展建议（How）
//! - 新增变体时同步更新 [`ConnectionError::category`]，否则默认会落入不可重试分支；
//! - 传输实现应通过 [`ConnectionError::transport`] 构造错误，避免自行拼装 `detail` 文案。

use std::{fmt, time::Duration};

use thiserror::Error;

use crate::{
    protocol::{ExpectedVersion, StreamState},
    settings::SettingsError,
};

/// 错误分类，驱动引擎内部的重试与上报决策。
///
/// - `Transient`：链路/节点层面的暂时性故障，引擎内部按策略重试；
/// - `Timeout`：某一类等待超出配置时长，语义上同样可恢复，但需与普通传输故障区分；
/// - `Conflict`：乐观并发冲突，逻辑错误，永不重试；
/// - `Rejected`：服务端明确拒绝（流已删除、权限不足、请求非法）；
/// - `Terminal`：连接已进入终态，任何后续调用都会得到同样结果；
/// - `Configuration`：配置或连接串无效。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCategory {
    Transient,
    Timeout,
    Conflict,
    Rejected,
    Terminal,
    Configuration,
}

impl ErrorCategory {
    /// 该类错误是否允许引擎在内部重试。
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCategory::Transient | ErrorCategory::Timeout)
    }
}

/// 传输层故障的细分类型，由传输实现从 `io::ErrorKind` 映射而来。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TransportErrorKind {
    /// 对端拒绝连接或地址不可达。
    Refused,
    /// 连接被重置或中止。
    Reset,
    /// 对端正常关闭（读到 EOF）或本地已关闭。
    Closed,
    /// TLS 握手或证书校验失败。
    Tls,
    /// 其余 IO 错误。
    Io,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportErrorKind::Refused => "refused",
            TransportErrorKind::Reset => "reset",
            TransportErrorKind::Closed => "closed",
            TransportErrorKind::Tls => "tls",
            TransportErrorKind::Io => "io",
        };
        f.write_str(label)
    }
}

/// 连接引擎的统一错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：调用方只需匹配一个枚举即可区分“稍后自动恢复”的故障与“必须自行处理”的结果；
/// - **契约 (What)**：
///   - 每个变体携带足以排障的上下文（流名、端点、耗时、次数）；
///   - `RetryExhausted` 通过 `#[source]` 链接最后一次瞬时故障，`Error::source()` 可逐级追溯；
/// - **风险 (Trade-offs)**：上下文使用 `String` 保存，克隆时有少量分配；错误路径不在热点上，可接受。
#[derive(Clone, Debug, Error)]
pub enum ConnectionError {
    /// 连接已关闭（主动关闭、重连次数耗尽或句柄被释放），永不复活。
    #[error("connection `{connection}` is closed")]
    Disposed { connection: String },

    /// `connect()` 只允许在初始状态调用一次。
    #[error("connection `{connection}` has already been started")]
    AlreadyStarted { connection: String },

    /// 在配置的时限内未能建立物理链路。
    #[error("connecting to {endpoint} did not complete within {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    /// 集群发现用尽全部尝试仍未找到可用节点。
    #[error("cluster discovery found no suitable node after {attempts} attempt(s)")]
    DiscoveryExhausted { attempts: u32 },

    /// 端点无法解析为具体地址。
    #[error("cannot resolve endpoint {endpoint}: {detail}")]
    Resolution { endpoint: String, detail: String },

    /// 传输层故障（建连、读、写、握手）。
    #[error("{operation} failed ({kind}): {detail}")]
    Transport {
        operation: &'static str,
        kind: TransportErrorKind,
        detail: String,
    },

    /// 已发出的请求在操作超时内没有收到任何应答。
    #[error("no response from server for append to `{stream}` within {elapsed:?}")]
    NoServerResponse { stream: String, elapsed: Duration },

    /// 服务端暂不处理（未就绪、过载或非 Leader），可换时机或换节点重试。
    #[error("server did not handle append to `{stream}`: {reason}")]
    NotHandled { stream: String, reason: String },

    /// 心跳窗口内链路上没有任何入站帧。
    #[error("no heartbeat from {endpoint} within {elapsed:?}")]
    HeartbeatTimeout { endpoint: String, elapsed: Duration },

    /// 期望版本与流的实际版本不符。
    #[error("append to `{stream}` expected version {expected} but the stream is at {actual}")]
    WrongExpectedVersion {
        stream: String,
        expected: ExpectedVersion,
        actual: StreamState,
    },

    /// 单个操作的重试预算耗尽。
    #[error("append to `{stream}` gave up after {retries} retries")]
    RetryExhausted {
        stream: String,
        retries: u32,
        #[source]
        last: Box<ConnectionError>,
    },

    #[error("stream `{stream}` has been deleted")]
    StreamDeleted { stream: String },

    #[error("access to stream `{stream}` denied")]
    AccessDenied { stream: String },

    #[error("server rejected append to `{stream}`: {detail}")]
    BadRequest { stream: String, detail: String },

    /// 等待队列已满。
    #[error("operation queue is full ({capacity} operations pending)")]
    QueueOverflow { capacity: usize },

    /// 对端违反了帧协议。
    #[error("protocol violation: {detail}")]
    Protocol { detail: String },

    /// 当前线程不在 Tokio 运行时内，无法启动后台任务。
    #[error("no Tokio runtime available: {detail}")]
    Runtime { detail: String },

    #[error(transparent)]
    Settings(#[from] SettingsError),
}

impl ConnectionError {
    /// 构造传输层错误。
    pub fn transport(
        operation: &'static str,
        kind: TransportErrorKind,
        detail: impl Into<String>,
    ) -> Self {
        ConnectionError::Transport {
            operation,
            kind,
            detail: detail.into(),
        }
    }

    pub(crate) fn disposed(connection: &str) -> Self {
        ConnectionError::Disposed {
            connection: connection.to_owned(),
        }
    }

    /// 返回错误分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            ConnectionError::Transport { .. }
            | ConnectionError::Resolution { .. }
            | ConnectionError::DiscoveryExhausted { .. }
            | ConnectionError::NotHandled { .. }
            | ConnectionError::Protocol { .. } => ErrorCategory::Transient,
            ConnectionError::ConnectTimeout { .. }
            | ConnectionError::NoServerResponse { .. }
            | ConnectionError::HeartbeatTimeout { .. } => ErrorCategory::Timeout,
            ConnectionError::WrongExpectedVersion { .. } => ErrorCategory::Conflict,
            ConnectionError::StreamDeleted { .. }
            | ConnectionError::AccessDenied { .. }
            | ConnectionError::BadRequest { .. }
            | ConnectionError::QueueOverflow { .. }
            | ConnectionError::RetryExhausted { .. } => ErrorCategory::Rejected,
            ConnectionError::Disposed { .. } | ConnectionError::AlreadyStarted { .. } => {
                ErrorCategory::Terminal
            }
            ConnectionError::Settings(_) | ConnectionError::Runtime { .. } => {
                ErrorCategory::Configuration
            }
        }
    }

    /// 引擎是否会在内部重试此类故障。
    pub fn is_transient(&self) -> bool {
        self.category().is_retryable()
    }

    /// 是否为“连接已销毁”。
    pub fn is_disposed(&self) -> bool {
        matches!(self, ConnectionError::Disposed { .. })
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn retry_exhausted_exposes_last_cause_as_source() {
        let cause = ConnectionError::NoServerResponse {
            stream: "orders".into(),
            elapsed: Duration::from_millis(40),
        };
        let err = ConnectionError::RetryExhausted {
            stream: "orders".into(),
            retries: 2,
            last: Box::new(cause),
        };
        let source = err.source().expect("RetryExhausted 必须携带原因");
        assert!(source.to_string().contains("no response from server"));
        assert_eq!(err.category(), ErrorCategory::Rejected);
        assert!(!err.is_transient());
    }

    #[test]
    fn conflicts_and_disposal_are_never_transient() {
        let conflict = ConnectionError::WrongExpectedVersion {
            stream: "s".into(),
            expected: ExpectedVersion::NoStream,
            actual: StreamState::At(0),
        };
        assert!(!conflict.is_transient());
        assert!(!ConnectionError::disposed("c").is_transient());
        assert!(
            ConnectionError::transport("tcp connect", TransportErrorKind::Refused, "down")
                .is_transient()
        );
    }
}
