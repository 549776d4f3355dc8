//! # connection：调用方面对的连接句柄
//!
//! ## 意图（Why）
//! - [`Connection`] 是廉价可克隆的句柄，所有方法只做“终态检查 + 向控制器发命令”，
//!   真正的状态迁移都发生在控制器任务中；
//! - [`ConnectionBuilder`] 汇集配置、目标与可替换的协作者（连接器、gossip 客户端、解析器），
//!   `build()` 时启动控制器任务。
//!
//! ## 契约（What）
//! - 每个公开入口先检查终态，已关闭时立即返回 [`ConnectionError::Disposed`]；
//! - 最后一个句柄被释放时，控制器以 [`CloseReason::Dropped`] 关闭连接；
//! - `close()` 幂等，不返回错误。
//!
//! ## 使用提示（How）
//! - `build()` 必须在 Tokio 运行时内调用；
//! - TCP/TLS 连接器由 `ledgerlink-transport-tcp` 提供，测试可使用 `test_util` 中的内存集群。

use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::{
    connection_string,
    controller::{Command, ConnectionState, Controller, Dependencies, Shared},
    discovery::{ClusterDiscoverer, GossipClient},
    endpoint::{ConnectTarget, DnsResolver, EndpointResolver, ResolvedEndpoint},
    error::ConnectionError,
    events::{CloseReason, ConnectionEvent, ConnectionEventKind, HandlerId},
    protocol::{AppendRequest, EventData, ExpectedVersion, WriteResult},
    settings::{ConnectionSettings, ConnectionSettingsBuilder, SettingsError},
    transport::Connector,
};

struct Inner {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

/// 到事件存储的逻辑连接。
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn name(&self) -> &str {
        &self.inner.shared.name
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.shared.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state()
    }

    /// 当前会话的端点快照；未连接时为 `None`。
    pub fn connected_endpoint(&self) -> Option<ResolvedEndpoint> {
        self.inner
            .shared
            .endpoint
            .load_full()
            .map(|endpoint| (*endpoint).clone())
    }

    fn disposed(&self) -> ConnectionError {
        ConnectionError::disposed(&self.inner.shared.name)
    }

    fn guard(&self) -> Result<(), ConnectionError> {
        if self.state().is_closed() {
            Err(self.disposed())
        } else {
            Ok(())
        }
    }

    fn send(&self, command: Command) -> Result<(), ConnectionError> {
        self.inner.commands.send(command).map_err(|_| self.disposed())
    }

    /// 启动连接。服务端不可达不会让本调用失败，建连在后台进行。
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.guard()?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect { reply })?;
        rx.await.map_err(|_| self.disposed())?
    }

    /// 等待进入 `Connected` 状态并返回端点。
    pub async fn wait_connected(&self, timeout: Duration) -> Result<ResolvedEndpoint, ConnectionError> {
        let mut state = self.inner.shared.state.subscribe();
        let wait = async {
            loop {
                let current = *state.borrow_and_update();
                match current {
                    ConnectionState::Connected => {
                        if let Some(endpoint) = self.connected_endpoint() {
                            return Ok(endpoint);
                        }
                    }
                    ConnectionState::Closed => return Err(self.disposed()),
                    _ => {}
                }
                if state.changed().await.is_err() {
                    return Err(self.disposed());
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::ConnectTimeout {
                endpoint: self.inner.shared.target.to_string(),
                timeout,
            }),
        }
    }

    /// 追加事件。瞬时故障在内部重试，调用方只会看到最终结果。
    pub async fn append_to_stream(
        &self,
        stream: impl Into<String>,
        expected_version: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<WriteResult, ConnectionError> {
        self.guard()?;
        let settings = &self.inner.shared.settings;
        let request = AppendRequest {
            stream: stream.into(),
            expected_version,
            events,
            require_leader: settings.require_leader,
            credentials: settings.default_credentials.clone(),
        };
        let (reply, rx) = oneshot::channel();
        self.send(Command::Append { request, reply })?;
        rx.await.map_err(|_| self.disposed())?
    }

    /// 关闭连接；重复调用无副作用。
    pub async fn close(&self) {
        if self.state().is_closed() {
            return;
        }
        let (done, rx) = oneshot::channel();
        if self
            .inner
            .commands
            .send(Command::Close {
                reason: CloseReason::Requested,
                done,
            })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// 注册生命周期处理器。
    pub fn on<F>(&self, kind: ConnectionEventKind, handler: F) -> HandlerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.shared.handlers.register(kind, Arc::new(handler))
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.inner.shared.handlers.remove(id)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.shared.name)
            .field("target", &self.inner.shared.target)
            .field("state", &self.state())
            .finish()
    }
}

/// 连接构建器。
pub struct ConnectionBuilder {
    target: ConnectTarget,
    name: Option<String>,
    settings: Result<ConnectionSettings, SettingsError>,
    connector: Option<Arc<dyn Connector>>,
    gossip: Option<Arc<dyn GossipClient>>,
    resolver: Arc<dyn EndpointResolver>,
}

impl ConnectionBuilder {
    pub fn new(target: ConnectTarget) -> Self {
        Self {
            target,
            name: None,
            settings: Ok(ConnectionSettings::default()),
            connector: None,
            gossip: None,
            resolver: Arc::new(DnsResolver),
        }
    }

    /// 由连接串构造；连接串中的配置可再被 [`ConnectionBuilder::settings`] 整体覆盖。
    pub fn from_connection_string(raw: &str) -> Result<Self, SettingsError> {
        let parsed = connection_string::parse(raw)?;
        let mut builder = Self::new(parsed.target);
        builder.settings = parsed.settings.build();
        Ok(builder)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn settings(mut self, settings: ConnectionSettings) -> Self {
        self.settings = Ok(settings);
        self
    }

    /// 以构建器形式提供配置，校验推迟到 `build()`。
    pub fn with_settings(mut self, settings: ConnectionSettingsBuilder) -> Self {
        self.settings = settings.build();
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn gossip(mut self, gossip: Arc<dyn GossipClient>) -> Self {
        self.gossip = Some(gossip);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn EndpointResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// 校验配置并启动控制器任务。
    pub fn build(self) -> Result<Connection, ConnectionError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|err| ConnectionError::Runtime {
            detail: err.to_string(),
        })?;
        let settings = self.settings?;
        settings.validate()?;
        let settings = Arc::new(settings);
        let connector = self.connector.ok_or(SettingsError::MissingConnector)?;

        let discoverer = if self.target.is_cluster() {
            let gossip = self.gossip.ok_or_else(|| SettingsError::MissingGossipClient {
                target: self.target.to_string(),
            })?;
            Some(Arc::new(ClusterDiscoverer::new(
                self.target.clone(),
                Arc::clone(&settings),
                gossip,
                Arc::clone(&self.resolver),
            )))
        } else {
            None
        };

        let name = self
            .name
            .unwrap_or_else(|| format!("ledgerlink-{}", Uuid::new_v4()));
        let shared = Arc::new(Shared::new(name, settings, self.target));
        let (commands, rx) = mpsc::unbounded_channel();
        let controller = Controller::new(
            Arc::clone(&shared),
            Dependencies {
                connector,
                resolver: self.resolver,
                discoverer,
            },
            rx,
        );
        runtime.spawn(controller.run());

        Ok(Connection {
            inner: Arc::new(Inner { shared, commands }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::InMemoryCluster;

    #[test]
    fn build_outside_runtime_fails() {
        let cluster = InMemoryCluster::new();
        let node = cluster.add_leader();
        let err = ConnectionBuilder::new(ConnectTarget::Single(node.tcp_endpoint()))
            .connector(cluster.connector())
            .build()
            .expect_err("运行时之外无法启动控制器");
        assert!(matches!(err, ConnectionError::Runtime { .. }));
    }

    #[tokio::test]
    async fn cluster_target_requires_gossip_client() {
        let cluster = InMemoryCluster::new();
        let err = ConnectionBuilder::new(ConnectTarget::GossipSeeds(vec![]))
            .connector(cluster.connector())
            .build()
            .expect_err("集群目标缺少 gossip 客户端");
        assert!(matches!(
            err,
            ConnectionError::Settings(SettingsError::MissingGossipClient { .. })
        ));
    }

    #[tokio::test]
    async fn calls_after_close_fail_with_disposed() {
        let cluster = InMemoryCluster::new();
        let node = cluster.add_leader();
        let connection = ConnectionBuilder::new(ConnectTarget::Single(node.tcp_endpoint()))
            .connector(cluster.connector())
            .build()
            .expect("构建连接");
        connection.close().await;
        connection.close().await;

        assert!(connection.connect().await.expect_err("已关闭").is_disposed());
        let append = connection
            .append_to_stream("s", ExpectedVersion::Any, vec![])
            .await;
        assert!(append.expect_err("已关闭").is_disposed());
        assert!(
            connection
                .wait_connected(Duration::from_millis(10))
                .await
                .expect_err("已关闭")
                .is_disposed()
        );
    }
}
