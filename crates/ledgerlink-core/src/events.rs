//! # events：连接生命周期通知
//!
//! ## 意图（Why）
//! - 调用方需要感知“已连接 / 已断开 / 正在重连 / 已关闭 / 出现错误”，以便记录或驱动自身状态；
//! - 通知按连接隔离，不存在全局订阅表。
//!
//! ## 契约（What）
//! - 处理器按注册顺序在控制器任务上同步调用，应保持轻量，不得阻塞；
//! - 调用前先在读锁下复制匹配的处理器列表并释放锁，处理器内部注册或注销其他处理器不会死锁；
//! - `Closed` 在一个连接的生命周期内恰好发出一次。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;

use crate::{endpoint::ResolvedEndpoint, error::ConnectionError};

/// 连接关闭的原因。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CloseReason {
    /// 调用方主动关闭。
    Requested,
    /// 重连次数超过上限。
    ReconnectionLimitReached,
    /// 最后一个连接句柄被释放。
    Dropped,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CloseReason::Requested => "close requested",
            CloseReason::ReconnectionLimitReached => "reconnection limit reached",
            CloseReason::Dropped => "connection handle dropped",
        };
        f.write_str(label)
    }
}

/// 事件种类，注册处理器时使用。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionEventKind {
    Connected,
    Disconnected,
    Reconnecting,
    Closed,
    ErrorOccurred,
}

/// 生命周期事件。
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    Connected {
        endpoint: ResolvedEndpoint,
    },
    Disconnected {
        endpoint: ResolvedEndpoint,
        reason: ConnectionError,
    },
    Reconnecting {
        attempt: u32,
    },
    Closed {
        reason: CloseReason,
    },
    ErrorOccurred {
        error: ConnectionError,
    },
}

impl ConnectionEvent {
    pub fn kind(&self) -> ConnectionEventKind {
        match self {
            ConnectionEvent::Connected { .. } => ConnectionEventKind::Connected,
            ConnectionEvent::Disconnected { .. } => ConnectionEventKind::Disconnected,
            ConnectionEvent::Reconnecting { .. } => ConnectionEventKind::Reconnecting,
            ConnectionEvent::Closed { .. } => ConnectionEventKind::Closed,
            ConnectionEvent::ErrorOccurred { .. } => ConnectionEventKind::ErrorOccurred,
        }
    }
}

/// 处理器注册句柄。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// 单个连接的处理器注册表。
#[derive(Default)]
pub(crate) struct EventHandlers {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(HandlerId, ConnectionEventKind, Handler)>>,
}

impl EventHandlers {
    pub(crate) fn register(&self, kind: ConnectionEventKind, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, kind, handler));
        id
    }

    pub(crate) fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(registered, _, _)| *registered != id);
        handlers.len() != before
    }

    pub(crate) fn emit(&self, event: &ConnectionEvent) {
        let kind = event.kind();
        let matching: Vec<Handler> = self
            .handlers
            .read()
            .iter()
            .filter(|(_, registered, _)| *registered == kind)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();
        for handler in matching {
            handler(event);
        }
    }
}
