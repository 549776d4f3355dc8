use std::io;
use std::time::Duration;

use ledgerlink_core::{ConnectionError, ResolvedEndpoint, TransportErrorKind};
use thiserror::Error;

/// 描述一次底层操作对应的稳定操作名与默认文案。
///
/// `name` 进入 [`ConnectionError::Transport`] 的 `operation` 字段，日志与断言据此区分
/// “建连失败”和“读失败”等阶段；`message` 只用于拼接人类可读的细节。
/// `pinned` 非空时该阶段的全部 IO 错误都归入同一细分（握手阶段一律视为 TLS 故障）。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub name: &'static str,
    pub message: &'static str,
    pub pinned: Option<TransportErrorKind>,
}

pub(crate) const CONNECT: OperationKind = OperationKind {
    name: "tcp connect",
    message: "opening tcp connection",
    pinned: None,
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    name: "tcp configure",
    message: "applying socket options",
    pinned: None,
};
pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    name: "tls handshake",
    message: "negotiating tls session",
    pinned: Some(TransportErrorKind::Tls),
};
pub(crate) const READ: OperationKind = OperationKind {
    name: "tcp read",
    message: "reading frame",
    pinned: None,
};
pub(crate) const WRITE: OperationKind = OperationKind {
    name: "tcp write",
    message: "writing frame",
    pinned: None,
};
pub(crate) const GOSSIP: OperationKind = OperationKind {
    name: "gossip query",
    message: "querying cluster members",
    pinned: None,
};

/// 将 IO 错误映射为引擎级 [`ConnectionError`]，并附带传输故障细分。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> ConnectionError {
    ConnectionError::transport(
        kind.name,
        categorize_io_error(kind, &error),
        format!("{}: {}", kind.message, error),
    )
}

/// 构造“对端已关闭”错误，读到 EOF 时使用。
pub(crate) fn closed_error(kind: OperationKind) -> ConnectionError {
    ConnectionError::transport(
        kind.name,
        TransportErrorKind::Closed,
        format!("{}: connection closed by peer", kind.message),
    )
}

/// 构造超时错误。
///
/// 建连、握手与 gossip 查询都属于“在时限内拿到一条可用链路”，统一归为 `ConnectTimeout`。
pub(crate) fn timeout_error(endpoint: &ResolvedEndpoint, timeout: Duration) -> ConnectionError {
    ConnectionError::ConnectTimeout {
        endpoint: endpoint.to_string(),
        timeout,
    }
}

fn categorize_io_error(kind: OperationKind, error: &io::Error) -> TransportErrorKind {
    use io::ErrorKind;
    if let Some(pinned) = kind.pinned {
        return pinned;
    }
    match error.kind() {
        ErrorKind::ConnectionRefused
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable => TransportErrorKind::Refused,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            TransportErrorKind::Reset
        }
        ErrorKind::UnexpectedEof | ErrorKind::WriteZero => TransportErrorKind::Closed,
        ErrorKind::InvalidData
            if error
                .get_ref()
                .is_some_and(|inner| inner.is::<rustls::Error>()) =>
        {
            TransportErrorKind::Tls
        }
        _ => TransportErrorKind::Io,
    }
}

/// 帧解码阶段的错误类型。
///
/// # 意图（Why）
/// - 帧格式违规意味着对端实现有缺陷或流已错位，链路无法继续使用；
/// - 独立的枚举便于单元测试精确断言违规类型，进入引擎时统一折叠为
///   [`ConnectionError::Protocol`]，由控制器按瞬时故障处理并重建会话。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum CodecError {
    #[error("frame of {length} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { length: usize, limit: usize },

    #[error("frame header declares {length} bytes, shorter than the fixed header")]
    FrameTooShort { length: usize },

    #[error("unknown command 0x{command:02X}")]
    UnknownCommand { command: u8 },

    #[error("command 0x{command:02X} is not valid in this direction")]
    UnexpectedCommand { command: u8 },

    #[error("payload truncated while reading {field}")]
    Truncated { field: &'static str },

    #[error("field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("field {field} carries invalid value {value}")]
    InvalidValue { field: &'static str, value: i64 },

    #[error("field {field} is too long to encode ({length} bytes)")]
    FieldTooLong { field: &'static str, length: usize },
}

impl From<CodecError> for ConnectionError {
    fn from(error: CodecError) -> Self {
        ConnectionError::Protocol {
            detail: error.to_string(),
        }
    }
}
