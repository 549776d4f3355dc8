//! 集成测试共用的事件记录器与构建辅助。
//!
//! - **意图 (Why)**：生命周期事件在控制器任务上同步触发，测试需要按顺序等待特定事件；
//! - **做法 (How)**：为全部事件种类注册同一个转发处理器，把事件克隆进无界通道，由测试按需拉取；
//! - **注意 (Gotchas)**：等待上限使用虚拟时间，测试必须以 `start_paused = true` 运行，否则会真实等待。

#![allow(dead_code)]

use std::time::Duration;

use ledgerlink_core::{
    ConnectTarget, Connection, ConnectionBuilder, ConnectionEvent, ConnectionEventKind,
    ConnectionSettings, test_util::InMemoryCluster,
};
use tokio::sync::mpsc;

const ALL_KINDS: [ConnectionEventKind; 5] = [
    ConnectionEventKind::Connected,
    ConnectionEventKind::Disconnected,
    ConnectionEventKind::Reconnecting,
    ConnectionEventKind::Closed,
    ConnectionEventKind::ErrorOccurred,
];

/// 等待单个事件的虚拟时间上限。
const EVENT_WAIT: Duration = Duration::from_secs(120);

pub struct EventRecorder {
    rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    seen: Vec<ConnectionEvent>,
}

impl EventRecorder {
    pub fn attach(connection: &Connection) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for kind in ALL_KINDS {
            let tx = tx.clone();
            connection.on(kind, move |event| {
                let _ = tx.send(event.clone());
            });
        }
        Self {
            rx,
            seen: Vec::new(),
        }
    }

    /// 拉取事件直到出现指定种类。
    pub async fn next_of(&mut self, kind: ConnectionEventKind) -> ConnectionEvent {
        loop {
            let event = tokio::time::timeout(EVENT_WAIT, self.rx.recv())
                .await
                .unwrap_or_else(|_| panic!("等待 {kind:?} 事件超时，已观测：{:?}", self.kinds()))
                .expect("事件通道不应关闭");
            self.seen.push(event.clone());
            if event.kind() == kind {
                return event;
            }
        }
    }

    /// 收下通道中已到达的全部事件。
    pub fn drain(&mut self) -> &[ConnectionEvent] {
        while let Ok(event) = self.rx.try_recv() {
            self.seen.push(event);
        }
        &self.seen
    }

    pub fn count(&mut self, kind: ConnectionEventKind) -> usize {
        self.drain().iter().filter(|event| event.kind() == kind).count()
    }

    pub fn kinds(&self) -> Vec<ConnectionEventKind> {
        self.seen.iter().map(ConnectionEvent::kind).collect()
    }
}

/// 针对内存集群中单个节点的连接。
pub fn single_node(
    cluster: &InMemoryCluster,
    target: ConnectTarget,
    settings: ConnectionSettings,
) -> Connection {
    ConnectionBuilder::new(target)
        .settings(settings)
        .connector(cluster.connector())
        .build()
        .expect("构建连接")
}

/// 针对内存集群 gossip 种子的连接。
pub fn clustered(cluster: &InMemoryCluster, settings: ConnectionSettings) -> Connection {
    ConnectionBuilder::new(ConnectTarget::GossipSeeds(cluster.gossip_seeds()))
        .settings(settings)
        .connector(cluster.connector())
        .gossip(cluster.gossip())
        .build()
        .expect("构建集群连接")
}
