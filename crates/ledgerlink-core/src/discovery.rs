//! # discovery：基于 gossip 的集群节点发现
//!
//! ## 核心意图（Why）
//! - 集群模式下，客户端不知道哪个节点当前可写；每轮建连前向候选节点查询成员表，
//!   选出最符合 [`NodePreference`] 的存活节点；
//! - 发现过程本身有次数与时限约束，耗尽后以 [`ConnectionError::DiscoveryExhausted`] 交还控制器，
//!   由控制器计作一次失败的重连尝试。
//!
//! ## 行为契约（What）
//! - 每一轮：候选 = 上次已知成员的 gossip 端点（排除刚刚失败的节点），若无已知成员则使用种子；
//!   全部候选并发查询，各自受 `gossip_timeout` 约束；
//! - 合并：以 TCP 端点为键，保留 `writer_checkpoint` 最大的条目；
//! - 排序：完全确定，先按角色优先级，再按 checkpoint 降序，最后按端点字典序；
//!   因此集群不变时反复发现总收敛到同一节点。
//!
//! ## 风险提示（Trade-offs）
//! - 不引入随机打散，负载会集中在排序最前的节点；对“优先 Leader”的写路径这是期望行为。

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    endpoint::{
        ConnectTarget, Endpoint, EndpointOrigin, EndpointResolver, ResolvedEndpoint, resolve_one,
    },
    error::ConnectionError,
    settings::{ConnectionSettings, NodePreference},
};

/// 节点在集群中的角色。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Leader,
    Follower,
    ReadOnlyReplica,
    Clone,
    CatchingUp,
    Manager,
    ShuttingDown,
    Unknown,
}

impl NodeRole {
    /// 该角色能否承接客户端连接。
    pub fn is_eligible(self) -> bool {
        matches!(
            self,
            NodeRole::Leader
                | NodeRole::Follower
                | NodeRole::ReadOnlyReplica
                | NodeRole::Clone
                | NodeRole::CatchingUp
        )
    }

    /// 角色在给定偏好下的名次，越小越优先。
    fn rank(self, preference: NodePreference) -> u8 {
        let order: [NodeRole; 3] = match preference {
            NodePreference::Leader => [NodeRole::Leader, NodeRole::Follower, NodeRole::ReadOnlyReplica],
            NodePreference::Follower => [NodeRole::Follower, NodeRole::ReadOnlyReplica, NodeRole::Leader],
            NodePreference::ReadOnlyReplica => {
                [NodeRole::ReadOnlyReplica, NodeRole::Follower, NodeRole::Leader]
            }
        };
        order
            .iter()
            .position(|role| *role == self)
            .map_or(order.len() as u8, |index| index as u8)
    }
}

/// gossip 成员表中的一项。
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub tcp_endpoint: Endpoint,
    pub gossip_endpoint: Endpoint,
    pub role: NodeRole,
    pub is_alive: bool,
    pub writer_checkpoint: i64,
}

/// gossip 查询协议抽象。
#[async_trait]
pub trait GossipClient: Send + Sync + 'static {
    /// 向 `gossip` 端点查询当前成员表。
    async fn cluster_members(
        &self,
        gossip: &ResolvedEndpoint,
    ) -> Result<Vec<ClusterMember>, ConnectionError>;
}

/// 从成员表中选出最佳节点；没有合格成员时返回 `None`。
pub fn select_best_member(
    members: &[ClusterMember],
    preference: NodePreference,
) -> Option<&ClusterMember> {
    members
        .iter()
        .filter(|member| member.is_alive && member.role.is_eligible())
        .min_by(|left, right| {
            left.role
                .rank(preference)
                .cmp(&right.role.rank(preference))
                .then_with(|| right.writer_checkpoint.cmp(&left.writer_checkpoint))
                .then_with(|| left.tcp_endpoint.cmp(&right.tcp_endpoint))
        })
}

/// 合并多份成员表，以 TCP 端点去重并保留 checkpoint 最大者。
pub fn merge_members(lists: impl IntoIterator<Item = Vec<ClusterMember>>) -> Vec<ClusterMember> {
    let mut merged: BTreeMap<Endpoint, ClusterMember> = BTreeMap::new();
    for member in lists.into_iter().flatten() {
        match merged.get(&member.tcp_endpoint) {
            Some(existing) if existing.writer_checkpoint >= member.writer_checkpoint => {}
            _ => {
                merged.insert(member.tcp_endpoint.clone(), member);
            }
        }
    }
    merged.into_values().collect()
}

/// 集群发现器，跨重连保留最近一次成员表。
pub struct ClusterDiscoverer {
    target: ConnectTarget,
    settings: Arc<ConnectionSettings>,
    gossip: Arc<dyn GossipClient>,
    resolver: Arc<dyn EndpointResolver>,
    known_members: Mutex<Vec<ClusterMember>>,
}

impl ClusterDiscoverer {
    pub fn new(
        target: ConnectTarget,
        settings: Arc<ConnectionSettings>,
        gossip: Arc<dyn GossipClient>,
        resolver: Arc<dyn EndpointResolver>,
    ) -> Self {
        Self {
            target,
            settings,
            gossip,
            resolver,
            known_members: Mutex::new(Vec::new()),
        }
    }

    /// 最近一次成功发现时的成员表快照。
    pub fn known_members(&self) -> Vec<ClusterMember> {
        self.known_members.lock().clone()
    }

    /// 执行一次完整的发现流程（最多 `max_discover_attempts` 轮）。
    ///
    /// `failed` 为上一次会话失败的端点，本轮候选中会排除该节点的 gossip 端点。
    pub async fn discover(
        &self,
        failed: Option<&ResolvedEndpoint>,
    ) -> Result<ResolvedEndpoint, ConnectionError> {
        let attempts = self.settings.max_discover_attempts;
        for attempt in 1..=attempts {
            match self.discover_once(failed).await {
                Ok(Some(endpoint)) => {
                    debug!(attempt, endpoint = %endpoint, "cluster discovery selected node");
                    return Ok(endpoint);
                }
                Ok(None) => {
                    debug!(attempt, "cluster discovery found no suitable member");
                }
                Err(err) => {
                    warn!(attempt, error = %err, "cluster discovery attempt failed");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.discover_attempt_delay).await;
            }
        }
        Err(ConnectionError::DiscoveryExhausted { attempts })
    }

    async fn discover_once(
        &self,
        failed: Option<&ResolvedEndpoint>,
    ) -> Result<Option<ResolvedEndpoint>, ConnectionError> {
        let candidates = self.candidates(failed).await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let timeout = self.settings.gossip_timeout;
        let queries = candidates.iter().map(|candidate| async move {
            match tokio::time::timeout(timeout, self.gossip.cluster_members(candidate)).await {
                Ok(Ok(members)) => Some(members),
                Ok(Err(err)) => {
                    debug!(gossip = %candidate, error = %err, "gossip query failed");
                    None
                }
                Err(_) => {
                    debug!(gossip = %candidate, ?timeout, "gossip query timed out");
                    None
                }
            }
        });
        let answers: Vec<Vec<ClusterMember>> = join_all(queries).await.into_iter().flatten().collect();
        if answers.is_empty() {
            return Ok(None);
        }

        let members = merge_members(answers);
        let Some(best) = select_best_member(&members, self.settings.node_preference).cloned() else {
            *self.known_members.lock() = members;
            return Ok(None);
        };
        *self.known_members.lock() = members;

        let resolved = resolve_one(self.resolver.as_ref(), &best.tcp_endpoint, EndpointOrigin::Gossip)
            .await?
            .with_role(best.role);
        Ok(Some(resolved))
    }

    async fn candidates(
        &self,
        failed: Option<&ResolvedEndpoint>,
    ) -> Result<Vec<ResolvedEndpoint>, ConnectionError> {
        let known = self.known_members();
        if !known.is_empty() {
            let mut resolved = Vec::with_capacity(known.len());
            for member in known {
                if let Some(failed) = failed
                    && failed.host == member.tcp_endpoint.host
                    && failed.addr.port() == member.tcp_endpoint.port
                {
                    continue;
                }
                match resolve_one(self.resolver.as_ref(), &member.gossip_endpoint, EndpointOrigin::Gossip).await {
                    Ok(endpoint) => resolved.push(endpoint),
                    Err(err) => debug!(error = %err, "skipping unresolvable gossip endpoint"),
                }
            }
            if !resolved.is_empty() {
                return Ok(resolved);
            }
        }
        self.seed_candidates().await
    }

    async fn seed_candidates(&self) -> Result<Vec<ResolvedEndpoint>, ConnectionError> {
        match &self.target {
            ConnectTarget::ClusterDns { dns, gossip_port } => {
                let endpoint = Endpoint::new(dns.clone(), *gossip_port);
                let addrs = self.resolver.resolve(&endpoint).await?;
                Ok(addrs
                    .into_iter()
                    .map(|addr| ResolvedEndpoint::new(addr, dns.clone(), EndpointOrigin::Dns))
                    .collect())
            }
            ConnectTarget::GossipSeeds(seeds) => {
                let mut resolved = Vec::with_capacity(seeds.len());
                for seed in seeds {
                    match resolve_one(self.resolver.as_ref(), seed, EndpointOrigin::Static).await {
                        Ok(endpoint) => resolved.push(endpoint),
                        Err(err) => debug!(seed = %seed, error = %err, "skipping unresolvable seed"),
                    }
                }
                Ok(resolved)
            }
            ConnectTarget::Single(endpoint) => {
                Ok(vec![resolve_one(self.resolver.as_ref(), endpoint, EndpointOrigin::Static).await?])
            }
        }
    }
}
