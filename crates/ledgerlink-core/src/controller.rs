//! # controller：连接状态机与唯一的所有者任务
//!
//! ## 核心意图（Why）
//! - 状态、会话槽位与操作队列只由一个 actor 任务修改，所有状态迁移天然串行，
//!   不需要跨任务加锁；调用方、会话读写任务与建连任务都只向它发送消息；
//! - 重连计数、建连超时、心跳判活与操作超时在同一个 `select!` 循环中驱动，
//!   便于在暂停时钟下做确定性测试。
//!
//! ## 状态机（What）
//! - `Init → Connecting → Connected ⇄ Reconnecting → Closed`，`Closed` 可从任意状态进入且不可逆；
//! - 建连成功：清零重连计数，发出 `Connected`，投递所有等待中的操作；
//! - 建连失败：发出 `ErrorOccurred`，进入 `Reconnecting`，延迟后再次尝试；
//! - 会话丢失与每次扣减预算的重试同样只以 `ErrorOccurred` 对外可见；
//! - 每次重连尝试先递增计数，超过上限即以 `ReconnectionLimitReached` 关闭；
//! - 服务端指明 Leader 时直接改连该节点，不计入失败次数。
//!
//! ## 风险提示（Trade-offs）
//! - 事件处理器在 actor 任务上同步执行，耗时的处理器会拖慢整个连接。

use std::{fmt, future, sync::Arc};

use arc_swap::ArcSwapOption;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    discovery::ClusterDiscoverer,
    endpoint::{ConnectTarget, Endpoint, EndpointOrigin, EndpointResolver, ResolvedEndpoint, resolve_one},
    error::ConnectionError,
    events::{CloseReason, ConnectionEvent, EventHandlers},
    protocol::{AppendRequest, Request, RequestBody, ResponseBody},
    queue::{Completion, OperationQueue, ReplyOutcome},
    session::{Session, SessionEvent},
    settings::{ConnectionSettings, SettingsError},
    transport::{Connector, Link, LinkOptions},
};

/// 连接的生命周期状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    Init,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Init => "init",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// 调用方可见的共享快照。
pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) settings: Arc<ConnectionSettings>,
    pub(crate) target: ConnectTarget,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) endpoint: ArcSwapOption<ResolvedEndpoint>,
    pub(crate) handlers: EventHandlers,
}

impl Shared {
    pub(crate) fn new(name: String, settings: Arc<ConnectionSettings>, target: ConnectTarget) -> Self {
        let (state, _) = watch::channel(ConnectionState::Init);
        Self {
            name,
            settings,
            target,
            state,
            endpoint: ArcSwapOption::empty(),
            handlers: EventHandlers::default(),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

/// 发往控制器的命令。
pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Append {
        request: AppendRequest,
        reply: Completion,
    },
    Close {
        reason: CloseReason,
        done: oneshot::Sender<()>,
    },
}

/// 建连所需的外部协作者。
#[derive(Clone)]
pub(crate) struct Dependencies {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) resolver: Arc<dyn EndpointResolver>,
    pub(crate) discoverer: Option<Arc<ClusterDiscoverer>>,
}

/// 一轮建连的目标来源。
#[derive(Clone, Debug)]
enum EstablishTarget {
    /// 按配置目标建连；集群模式下排除刚刚失败的节点。
    Configured { failed: Option<ResolvedEndpoint> },
    /// 直连服务端指明的 Leader。
    Redirect(Endpoint),
}

struct EstablishFailure {
    error: ConnectionError,
    endpoint: Option<ResolvedEndpoint>,
}

struct Established {
    generation: u64,
    result: Result<(Box<dyn Link>, ResolvedEndpoint), EstablishFailure>,
}

pub(crate) struct Controller {
    shared: Arc<Shared>,
    deps: Dependencies,
    state: ConnectionState,
    session: Option<Session>,
    next_session: u64,
    queue: OperationQueue,
    reconnect_attempts: u32,
    reconnect_at: Option<Instant>,
    last_failed: Option<ResolvedEndpoint>,
    establishing: Option<JoinHandle<()>>,
    generation: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    established_tx: mpsc::UnboundedSender<Established>,
    established_rx: mpsc::UnboundedReceiver<Established>,
}

impl Controller {
    pub(crate) fn new(
        shared: Arc<Shared>,
        deps: Dependencies,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (established_tx, established_rx) = mpsc::unbounded_channel();
        let queue = OperationQueue::new(Arc::clone(&shared.settings));
        Self {
            shared,
            deps,
            state: ConnectionState::Init,
            session: None,
            next_session: 0,
            queue,
            reconnect_attempts: 0,
            reconnect_at: None,
            last_failed: None,
            establishing: None,
            generation: 0,
            commands,
            session_tx,
            session_rx,
            established_tx,
            established_rx,
        }
    }

    /// actor 主循环；所有句柄释放或连接关闭后返回。
    pub(crate) async fn run(mut self) {
        let mut timeout_check =
            tokio::time::interval(self.shared.settings.operation_timeout_check_period);
        timeout_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.state.is_closed() {
            let heartbeat_due = self.heartbeat_deadline();
            let reconnect_due = self.reconnect_at;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => self.close(CloseReason::Dropped),
                },
                Some(event) = self.session_rx.recv() => self.handle_session_event(event),
                Some(established) = self.established_rx.recv() => self.handle_established(established),
                _ = sleep_until(reconnect_due), if reconnect_due.is_some() => self.reconnect(),
                _ = sleep_until(heartbeat_due), if heartbeat_due.is_some() => self.check_heartbeat(),
                _ = timeout_check.tick() => self.check_timeouts(),
            }
        }
        debug!(connection = %self.shared.name, "controller stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => {
                let _ = reply.send(self.start());
            }
            Command::Append { request, reply } => {
                if self.state.is_closed() {
                    let _ = reply.send(Err(ConnectionError::disposed(&self.shared.name)));
                    return;
                }
                self.queue.enqueue(request, reply);
                self.dispatch();
            }
            Command::Close { reason, done } => {
                self.close(reason);
                let _ = done.send(());
            }
        }
    }

    fn start(&mut self) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Init => {
                info!(connection = %self.shared.name, target = %self.shared.target, "connecting");
                self.transition(ConnectionState::Connecting);
                self.begin_establish(EstablishTarget::Configured { failed: None });
                Ok(())
            }
            ConnectionState::Closed => Err(ConnectionError::disposed(&self.shared.name)),
            _ => Err(ConnectionError::AlreadyStarted {
                connection: self.shared.name.clone(),
            }),
        }
    }

    fn transition(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(connection = %self.shared.name, from = %self.state, to = %state, "state transition");
        }
        self.state = state;
        self.shared.state.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        self.shared.handlers.emit(&event);
    }

    fn begin_establish(&mut self, target: EstablishTarget) {
        if let Some(task) = self.establishing.take() {
            task.abort();
        }
        self.generation += 1;
        let generation = self.generation;
        let deps = self.deps.clone();
        let settings = Arc::clone(&self.shared.settings);
        let configured = self.shared.target.clone();
        let tx = self.established_tx.clone();
        self.establishing = Some(tokio::spawn(async move {
            let result = establish(&deps, &settings, &configured, target).await;
            let _ = tx.send(Established { generation, result });
        }));
    }

    fn handle_established(&mut self, established: Established) {
        let Established { generation, result } = established;
        if generation != self.generation || self.state.is_closed() || self.session.is_some() {
            if let Ok((link, endpoint)) = result {
                debug!(connection = %self.shared.name, endpoint = %endpoint, "discarding stale link");
                tokio::spawn(async move { link.close().await });
            }
            return;
        }
        self.establishing = None;
        match result {
            Ok((link, endpoint)) => self.install_session(link, endpoint),
            Err(EstablishFailure { error, endpoint }) => {
                warn!(connection = %self.shared.name, error = %error, "connection attempt failed");
                if endpoint.is_some() {
                    self.last_failed = endpoint;
                }
                self.emit(ConnectionEvent::ErrorOccurred { error });
                self.schedule_reconnect();
            }
        }
    }

    fn install_session(&mut self, link: Box<dyn Link>, endpoint: ResolvedEndpoint) {
        self.next_session += 1;
        let session = Session::start(
            self.next_session,
            endpoint.clone(),
            link,
            self.session_tx.clone(),
        );
        self.session = Some(session);
        self.reconnect_attempts = 0;
        self.last_failed = None;
        self.shared.endpoint.store(Some(Arc::new(endpoint.clone())));
        self.transition(ConnectionState::Connected);
        info!(
            connection = %self.shared.name,
            endpoint = %endpoint,
            session = self.next_session,
            "connected"
        );
        self.emit(ConnectionEvent::Connected { endpoint });
        self.dispatch();
    }

    fn schedule_reconnect(&mut self) {
        self.transition(ConnectionState::Reconnecting);
        // 延迟超出时钟可表示范围时视为“永不自动重连”，只能由 close 结束。
        self.reconnect_at = Instant::now().checked_add(self.shared.settings.reconnection_delay);
    }

    fn reconnect(&mut self) {
        self.reconnect_at = None;
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        let attempt = self.reconnect_attempts;
        if self.shared.settings.max_reconnections.is_exceeded_by(attempt) {
            warn!(connection = %self.shared.name, attempt, "reconnection limit reached");
            self.close(CloseReason::ReconnectionLimitReached);
            return;
        }
        info!(connection = %self.shared.name, attempt, "reconnecting");
        self.emit(ConnectionEvent::Reconnecting { attempt });
        self.begin_establish(EstablishTarget::Configured {
            failed: self.last_failed.clone(),
        });
    }

    /// 拆除当前会话并把在途操作放回队列。
    fn lose_session(&mut self, reason: ConnectionError) {
        let Some(session) = self.session.take() else {
            return;
        };
        let endpoint = session.endpoint().clone();
        let id = session.id();
        session.shutdown();
        self.shared.endpoint.store(None);
        self.queue.requeue_in_flight(&reason);
        warn!(
            connection = %self.shared.name,
            endpoint = %endpoint,
            session = id,
            error = %reason,
            "session lost"
        );
        self.last_failed = Some(endpoint.clone());
        self.emit(ConnectionEvent::Disconnected {
            endpoint,
            reason: reason.clone(),
        });
        self.emit(ConnectionEvent::ErrorOccurred { error: reason });
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Received { session, response } => {
                let Some(current) = self.session.as_mut().filter(|s| s.id() == session) else {
                    debug!(connection = %self.shared.name, session, "ignoring frame from replaced session");
                    return;
                };
                current.last_received = Instant::now();
                current.heartbeat_sent = false;

                match response.body {
                    ResponseBody::HeartbeatRequest => {
                        current.send(Request {
                            correlation: response.correlation,
                            body: RequestBody::HeartbeatResponse,
                        });
                    }
                    ResponseBody::HeartbeatResponse => {}
                    body => match self.queue.complete(response.correlation, body) {
                        ReplyOutcome::Completed => self.dispatch(),
                        ReplyOutcome::Retried { cause } => {
                            self.emit(ConnectionEvent::ErrorOccurred { error: cause });
                            self.dispatch();
                        }
                        ReplyOutcome::NotLeader { leader, cause } => self.redirect(leader, cause),
                        ReplyOutcome::Unknown => debug!(
                            connection = %self.shared.name,
                            correlation = %response.correlation,
                            "reply for unknown correlation"
                        ),
                    },
                }
            }
            SessionEvent::Failed { session, error } => {
                if self.session.as_ref().is_some_and(|s| s.id() == session) {
                    self.lose_session(error);
                    self.schedule_reconnect();
                }
            }
        }
    }

    fn redirect(&mut self, leader: Endpoint, cause: ConnectionError) {
        let already_there = self.session.as_ref().is_some_and(|session| {
            session.endpoint().host == leader.host && session.endpoint().addr.port() == leader.port
        });
        if already_there {
            self.dispatch();
            return;
        }
        info!(connection = %self.shared.name, leader = %leader, "reconnecting to advertised leader");
        self.lose_session(cause);
        self.reconnect_at = None;
        self.transition(ConnectionState::Reconnecting);
        self.begin_establish(EstablishTarget::Redirect(leader));
    }

    fn heartbeat_deadline(&self) -> Option<Instant> {
        let settings = &self.shared.settings;
        self.session.as_ref().and_then(|session| {
            let mut silence = settings.heartbeat_interval;
            if session.heartbeat_sent {
                silence = silence.checked_add(settings.heartbeat_timeout)?;
            }
            session.last_received.checked_add(silence)
        })
    }

    fn check_heartbeat(&mut self) {
        let interval = self.shared.settings.heartbeat_interval;
        let timeout = self.shared.settings.heartbeat_timeout;
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let silent = Instant::now().duration_since(session.last_received);
        if silent >= interval.saturating_add(timeout) {
            let error = ConnectionError::HeartbeatTimeout {
                endpoint: session.endpoint().to_string(),
                elapsed: silent,
            };
            self.lose_session(error);
            self.schedule_reconnect();
        } else if !session.heartbeat_sent && silent >= interval {
            let correlation = self.queue.next_correlation();
            if let Some(session) = self.session.as_mut() {
                session.heartbeat_sent = true;
                session.send(Request {
                    correlation,
                    body: RequestBody::HeartbeatRequest,
                });
                debug!(connection = %self.shared.name, %correlation, "heartbeat request sent");
            }
        }
    }

    fn check_timeouts(&mut self) {
        let now = Instant::now();
        if self.session.is_some() {
            if self.shared.settings.fail_on_no_server_response && self.queue.has_expired(now) {
                if let Some(cause) = self.queue.expire(now) {
                    self.lose_session(cause);
                    self.schedule_reconnect();
                }
            } else if let Some(cause) = self.queue.expire(now) {
                self.emit(ConnectionEvent::ErrorOccurred { error: cause });
            }
        }
        self.queue.release_parked();
        self.dispatch();
    }

    fn dispatch(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let sent = self.queue.dispatch(Instant::now(), |request| session.send(request));
        if sent > 0 {
            debug!(
                connection = %self.shared.name,
                sent,
                in_flight = self.queue.in_flight_len(),
                "dispatched queued appends"
            );
        }
    }

    fn close(&mut self, reason: CloseReason) {
        if self.state.is_closed() {
            return;
        }
        self.transition(ConnectionState::Closed);
        if let Some(task) = self.establishing.take() {
            task.abort();
        }
        self.reconnect_at = None;
        if let Some(session) = self.session.take() {
            session.shutdown();
        }
        self.shared.endpoint.store(None);
        self.queue.fail_all(&ConnectionError::disposed(&self.shared.name));
        info!(connection = %self.shared.name, reason = %reason, "connection closed");
        self.emit(ConnectionEvent::Closed { reason });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// 一轮建连：解析或发现目标，再在建连超时内打开链路。
async fn establish(
    deps: &Dependencies,
    settings: &ConnectionSettings,
    configured: &ConnectTarget,
    target: EstablishTarget,
) -> Result<(Box<dyn Link>, ResolvedEndpoint), EstablishFailure> {
    let unresolved = |error: ConnectionError| EstablishFailure {
        error,
        endpoint: None,
    };
    let endpoint = match (target, configured) {
        (EstablishTarget::Redirect(leader), _) => {
            resolve_one(deps.resolver.as_ref(), &leader, EndpointOrigin::Gossip)
                .await
                .map_err(unresolved)?
        }
        (EstablishTarget::Configured { .. }, ConnectTarget::Single(endpoint)) => {
            resolve_one(deps.resolver.as_ref(), endpoint, EndpointOrigin::Static)
                .await
                .map_err(unresolved)?
        }
        (EstablishTarget::Configured { failed }, cluster) => {
            let Some(discoverer) = deps.discoverer.as_ref() else {
                return Err(unresolved(
                    SettingsError::MissingGossipClient {
                        target: cluster.to_string(),
                    }
                    .into(),
                ));
            };
            discoverer.discover(failed.as_ref()).await.map_err(unresolved)?
        }
    };

    let options = LinkOptions::from_settings(settings);
    debug!(endpoint = %endpoint, tls = options.tls.is_some(), "opening link");
    let opened = tokio::time::timeout(
        settings.connection_timeout,
        deps.connector.open(&endpoint, &options),
    )
    .await;
    match opened {
        Ok(Ok(link)) => Ok((link, endpoint)),
        Ok(Err(error)) => Err(EstablishFailure {
            error,
            endpoint: Some(endpoint),
        }),
        Err(_) => Err(EstablishFailure {
            error: ConnectionError::ConnectTimeout {
                endpoint: endpoint.to_string(),
                timeout: settings.connection_timeout,
            },
            endpoint: Some(endpoint),
        }),
    }
}
