//! # test_util：内存中的事件存储集群
//!
//! ## 定位（Why）
//! - 控制器、发现与队列的行为需要在“节点宕机、节点失联、Leader 切换”等场景下验证，
//!   真实网络既慢又不确定；内存集群配合 Tokio 暂停时钟即可得到确定性的测试；
//! - 通过 `test-util` feature 对下游开放，集成测试与传输 crate 的测试都可复用。
//!
//! ## 模型（What）
//! - 每个节点拥有固定的 TCP 与 gossip 地址（`10.0.0.N:1113` / `10.0.0.N:2113`）；
//! - 所有节点共享同一份流存储，相当于一个复制瞬时完成的集群；
//! - `stop()` 断开该节点全部链路并拒绝新连接；`set_responsive(false)` 让节点吞掉所有请求，
//!   新建连与 gossip 查询则一直挂起，由调用方的超时兜底。

use std::{
    collections::HashMap,
    future,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use crate::{
    discovery::{ClusterMember, GossipClient, NodeRole},
    endpoint::{Endpoint, EndpointResolver, ResolvedEndpoint},
    error::{ConnectionError, TransportErrorKind},
    protocol::{
        AppendRequest, NotHandledReason, Position, Request, RequestBody, Response, ResponseBody,
        StreamState, WriteResult,
    },
    transport::{Connector, Link, LinkOptions},
};

/// 单个事件在日志中占用的跨度，用于生成严格递增的位置。
const EVENT_SPAN: u64 = 128;

pub const NODE_TCP_PORT: u16 = 1113;
pub const NODE_GOSSIP_PORT: u16 = 2113;

#[derive(Default)]
struct Store {
    streams: HashMap<String, u64>,
    position: u64,
}

struct NodeState {
    tcp: SocketAddr,
    gossip: SocketAddr,
    role: Mutex<NodeRole>,
    running: AtomicBool,
    responsive: AtomicBool,
    open_attempts: AtomicU32,
    gossip_queries: AtomicU32,
    links: Mutex<HashMap<u64, mpsc::UnboundedSender<Response>>>,
}

impl NodeState {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn is_responsive(&self) -> bool {
        self.responsive.load(Ordering::Acquire)
    }

    fn role(&self) -> NodeRole {
        *self.role.lock()
    }
}

#[derive(Default)]
struct ClusterState {
    nodes: RwLock<Vec<Arc<NodeState>>>,
    store: Mutex<Store>,
    next_link: AtomicU64,
}

impl ClusterState {
    fn node_by(&self, matches: impl Fn(&NodeState) -> bool) -> Option<Arc<NodeState>> {
        self.nodes.read().iter().find(|node| matches(node)).cloned()
    }

    fn leader_endpoint(&self) -> Option<Endpoint> {
        self.node_by(|node| node.is_running() && node.role() == NodeRole::Leader)
            .map(|node| Endpoint::from(node.tcp))
    }

    fn members(&self) -> Vec<ClusterMember> {
        let checkpoint = i64::try_from(self.store.lock().position).unwrap_or(i64::MAX);
        self.nodes
            .read()
            .iter()
            .map(|node| ClusterMember {
                tcp_endpoint: Endpoint::from(node.tcp),
                gossip_endpoint: Endpoint::from(node.gossip),
                role: node.role(),
                is_alive: node.is_running(),
                writer_checkpoint: checkpoint,
            })
            .collect()
    }

    fn handle_append(&self, node: &NodeState, append: AppendRequest) -> ResponseBody {
        let role = node.role();
        if append.require_leader && role != NodeRole::Leader {
            return ResponseBody::NotHandled(NotHandledReason::NotLeader {
                leader: self.leader_endpoint(),
            });
        }
        if !role.is_eligible() {
            return ResponseBody::NotHandled(NotHandledReason::NotReady);
        }

        let mut store = self.store.lock();
        let current = store
            .streams
            .get(&append.stream)
            .map_or(StreamState::NoStream, |version| StreamState::At(*version));
        if !append.expected_version.matches(current) {
            return ResponseBody::WrongExpectedVersion { current };
        }
        let count = append.events.len() as u64;
        let next_expected_version = match (current, count) {
            (StreamState::At(version), _) => version + count,
            (StreamState::NoStream, 0) => 0,
            (StreamState::NoStream, _) => count - 1,
        };
        if count > 0 {
            store.position += count * EVENT_SPAN;
            store.streams.insert(append.stream, next_expected_version);
        }
        ResponseBody::AppendCompleted(WriteResult {
            next_expected_version,
            log_position: Position::new(store.position, store.position),
        })
    }
}

/// 内存集群。
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<ClusterState>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新增一个节点；地址按加入顺序分配。
    pub fn add_node(&self, role: NodeRole) -> NodeHandle {
        let mut nodes = self.state.nodes.write();
        let index = u8::try_from(nodes.len() + 1).unwrap_or(u8::MAX);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, index));
        let node = Arc::new(NodeState {
            tcp: SocketAddr::new(ip, NODE_TCP_PORT),
            gossip: SocketAddr::new(ip, NODE_GOSSIP_PORT),
            role: Mutex::new(role),
            running: AtomicBool::new(true),
            responsive: AtomicBool::new(true),
            open_attempts: AtomicU32::new(0),
            gossip_queries: AtomicU32::new(0),
            links: Mutex::new(HashMap::new()),
        });
        nodes.push(Arc::clone(&node));
        NodeHandle {
            node,
            cluster: Arc::clone(&self.state),
        }
    }

    pub fn add_leader(&self) -> NodeHandle {
        self.add_node(NodeRole::Leader)
    }

    pub fn nodes(&self) -> Vec<NodeHandle> {
        self.state
            .nodes
            .read()
            .iter()
            .map(|node| NodeHandle {
                node: Arc::clone(node),
                cluster: Arc::clone(&self.state),
            })
            .collect()
    }

    /// 全部节点的 gossip 端点，可直接作为种子列表。
    pub fn gossip_seeds(&self) -> Vec<Endpoint> {
        self.state
            .nodes
            .read()
            .iter()
            .map(|node| Endpoint::from(node.gossip))
            .collect()
    }

    pub fn connector(&self) -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector {
            cluster: Arc::clone(&self.state),
            last_options: Mutex::new(None),
        })
    }

    pub fn gossip(&self) -> Arc<MemoryGossip> {
        Arc::new(MemoryGossip {
            cluster: Arc::clone(&self.state),
        })
    }

    /// 流当前的最后事件编号。
    pub fn stream_version(&self, stream: &str) -> Option<u64> {
        self.state.store.lock().streams.get(stream).copied()
    }
}

/// 节点操控句柄。
#[derive(Clone)]
pub struct NodeHandle {
    node: Arc<NodeState>,
    cluster: Arc<ClusterState>,
}

impl NodeHandle {
    pub fn tcp_addr(&self) -> SocketAddr {
        self.node.tcp
    }

    pub fn tcp_endpoint(&self) -> Endpoint {
        Endpoint::from(self.node.tcp)
    }

    pub fn gossip_endpoint(&self) -> Endpoint {
        Endpoint::from(self.node.gossip)
    }

    pub fn role(&self) -> NodeRole {
        self.node.role()
    }

    pub fn set_role(&self, role: NodeRole) {
        *self.node.role.lock() = role;
    }

    /// 把本节点设为 Leader，其余 Leader 降级为 Follower。
    pub fn promote(&self) {
        for node in self.cluster.nodes.read().iter() {
            let mut role = node.role.lock();
            if Arc::ptr_eq(node, &self.node) {
                *role = NodeRole::Leader;
            } else if *role == NodeRole::Leader {
                *role = NodeRole::Follower;
            }
        }
    }

    /// 停机：断开全部链路并拒绝新连接。
    pub fn stop(&self) {
        self.node.running.store(false, Ordering::Release);
        self.drop_connections();
    }

    pub fn start(&self) {
        self.node.running.store(true, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.node.is_running()
    }

    /// 保持运行但断开现有链路。
    pub fn drop_connections(&self) {
        self.node.links.lock().clear();
    }

    pub fn set_responsive(&self, responsive: bool) {
        self.node.responsive.store(responsive, Ordering::Release);
    }

    pub fn open_attempts(&self) -> u32 {
        self.node.open_attempts.load(Ordering::Acquire)
    }

    pub fn gossip_queries(&self) -> u32 {
        self.node.gossip_queries.load(Ordering::Acquire)
    }

    pub fn active_links(&self) -> usize {
        self.node.links.lock().len()
    }
}

/// 内存连接器。
pub struct MemoryConnector {
    cluster: Arc<ClusterState>,
    last_options: Mutex<Option<LinkOptions>>,
}

impl MemoryConnector {
    /// 最近一次建连使用的参数。
    pub fn last_options(&self) -> Option<LinkOptions> {
        self.last_options.lock().clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(
        &self,
        endpoint: &ResolvedEndpoint,
        options: &LinkOptions,
    ) -> Result<Box<dyn Link>, ConnectionError> {
        *self.last_options.lock() = Some(options.clone());
        let refused = || {
            ConnectionError::transport(
                "memory connect",
                TransportErrorKind::Refused,
                format!("nothing listening on {}", endpoint.addr),
            )
        };
        let node = self
            .cluster
            .node_by(|node| node.tcp == endpoint.addr)
            .ok_or_else(refused)?;
        node.open_attempts.fetch_add(1, Ordering::AcqRel);
        if !node.is_running() {
            return Err(refused());
        }
        if !node.is_responsive() {
            future::pending::<()>().await;
        }

        let id = self.cluster.next_link.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        node.links.lock().insert(id, tx);
        Ok(Box::new(MemoryLink {
            id,
            node,
            cluster: Arc::clone(&self.cluster),
            responses: AsyncMutex::new(rx),
        }))
    }
}

struct MemoryLink {
    id: u64,
    node: Arc<NodeState>,
    cluster: Arc<ClusterState>,
    responses: AsyncMutex<mpsc::UnboundedReceiver<Response>>,
}

#[async_trait]
impl Link for MemoryLink {
    fn remote(&self) -> SocketAddr {
        self.node.tcp
    }

    async fn send(&self, request: Request) -> Result<(), ConnectionError> {
        let Some(replies) = self.node.links.lock().get(&self.id).cloned() else {
            return Err(ConnectionError::transport(
                "memory send",
                TransportErrorKind::Reset,
                "link closed by server",
            ));
        };
        if !self.node.is_responsive() {
            return Ok(());
        }
        let body = match request.body {
            RequestBody::HeartbeatRequest => ResponseBody::HeartbeatResponse,
            RequestBody::HeartbeatResponse => return Ok(()),
            RequestBody::Append(append) => self.cluster.handle_append(&self.node, append),
        };
        let _ = replies.send(Response {
            correlation: request.correlation,
            body,
        });
        Ok(())
    }

    async fn receive(&self) -> Result<Response, ConnectionError> {
        self.responses.lock().await.recv().await.ok_or_else(|| {
            ConnectionError::transport(
                "memory receive",
                TransportErrorKind::Closed,
                "connection closed by server",
            )
        })
    }

    async fn close(&self) {
        self.node.links.lock().remove(&self.id);
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.node.links.lock().remove(&self.id);
    }
}

/// 内存 gossip 客户端。
pub struct MemoryGossip {
    cluster: Arc<ClusterState>,
}

#[async_trait]
impl GossipClient for MemoryGossip {
    async fn cluster_members(
        &self,
        gossip: &ResolvedEndpoint,
    ) -> Result<Vec<ClusterMember>, ConnectionError> {
        let refused = || {
            ConnectionError::transport(
                "memory gossip",
                TransportErrorKind::Refused,
                format!("no gossip listener on {}", gossip.addr),
            )
        };
        let node = self
            .cluster
            .node_by(|node| node.gossip == gossip.addr)
            .ok_or_else(refused)?;
        node.gossip_queries.fetch_add(1, Ordering::AcqRel);
        if !node.is_running() {
            return Err(refused());
        }
        if !node.is_responsive() {
            future::pending::<()>().await;
        }
        Ok(self.cluster.members())
    }
}

/// 静态名称表解析器。
#[derive(Default)]
pub struct StaticResolver {
    hosts: RwLock<HashMap<String, Vec<SocketAddr>>>,
    lookups: AtomicU32,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, host: impl Into<String>, addrs: Vec<SocketAddr>) -> Self {
        self.hosts.write().insert(host.into(), addrs);
        self
    }

    /// 名称查询次数（IP 字面量不计）。
    pub fn lookups(&self) -> u32 {
        self.lookups.load(Ordering::Acquire)
    }
}

#[async_trait]
impl EndpointResolver for StaticResolver {
    async fn resolve(&self, endpoint: &Endpoint) -> Result<Vec<SocketAddr>, ConnectionError> {
        if let Some(ip) = endpoint.ip() {
            return Ok(vec![SocketAddr::new(ip, endpoint.port)]);
        }
        self.lookups.fetch_add(1, Ordering::AcqRel);
        self.hosts
            .read()
            .get(&endpoint.host)
            .filter(|addrs| !addrs.is_empty())
            .map(|addrs| {
                addrs
                    .iter()
                    .map(|addr| SocketAddr::new(addr.ip(), endpoint.port))
                    .collect()
            })
            .ok_or_else(|| ConnectionError::Resolution {
                endpoint: endpoint.to_string(),
                detail: "host not found".into(),
            })
    }
}
