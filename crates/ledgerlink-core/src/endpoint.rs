//! # endpoint：目标描述与地址解析
//!
//! ## 意图（Why）
//! - 把“用户配置的连接目标”（单节点地址、DNS 名称、集群种子列表）与“本轮建连实际使用的套接字地址”
//!   区分开：前者长期不变，后者在每次重连时重新计算；
//! - 解析过程抽象为 [`EndpointResolver`] trait，默认实现委托给 Tokio 的系统解析器，测试可注入静态表。
//!
//! ## 契约（What）
//! - [`ResolvedEndpoint`] 保留原始主机名，TLS 握手据此填写 SNI；
//! - `origin` 标记地址来源（静态 IP、DNS、Gossip），仅用于观测与排障，不影响控制流。

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{discovery::NodeRole, error::ConnectionError, settings::SettingsError};

/// 主机 + 端口。主机可以是 IP 字面量或 DNS 名称。
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// 主机部分是否为 IP 字面量。
    pub fn ip(&self) -> Option<IpAddr> {
        self.host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .ok()
    }

    pub fn is_dns(&self) -> bool {
        self.ip().is_none()
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(IpAddr::V6(ip)) => write!(f, "[{ip}]:{}", self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl FromStr for Endpoint {
    type Err = SettingsError;

    /// 解析 `host:port` 或 `[v6]:port`。
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let invalid = || SettingsError::InvalidEndpoint {
            value: raw.to_owned(),
        };
        let (host, port) = if let Some(rest) = raw.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            (host, tail.strip_prefix(':').ok_or_else(invalid)?)
        } else {
            raw.rsplit_once(':').ok_or_else(invalid)?
        };
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Endpoint::new(host, port))
    }
}

/// 用户配置的连接目标。
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConnectTarget {
    /// 直接连接单个节点，不做集群发现。
    Single(Endpoint),
    /// 解析 DNS 得到全部 gossip 地址，再做集群发现。
    ClusterDns { dns: String, gossip_port: u16 },
    /// 以固定种子列表做集群发现。
    GossipSeeds(Vec<Endpoint>),
}

impl ConnectTarget {
    pub fn is_cluster(&self) -> bool {
        !matches!(self, ConnectTarget::Single(_))
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectTarget::Single(endpoint) => write!(f, "{endpoint}"),
            ConnectTarget::ClusterDns { dns, gossip_port } => {
                write!(f, "discover://{dns}:{gossip_port}")
            }
            ConnectTarget::GossipSeeds(seeds) => {
                let rendered: Vec<String> = seeds.iter().map(ToString::to_string).collect();
                write!(f, "gossip[{}]", rendered.join(","))
            }
        }
    }
}

/// 地址来源。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EndpointOrigin {
    Static,
    Dns,
    Gossip,
}

/// 本轮建连使用的具体地址及其元数据。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedEndpoint {
    pub addr: SocketAddr,
    /// 原始主机名（或 IP 文本），TLS 握手据此确定服务器名称。
    pub host: String,
    pub origin: EndpointOrigin,
    pub role: Option<NodeRole>,
}

impl ResolvedEndpoint {
    pub fn new(addr: SocketAddr, host: impl Into<String>, origin: EndpointOrigin) -> Self {
        Self {
            addr,
            host: host.into(),
            origin,
            role: None,
        }
    }

    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn is_dns_derived(&self) -> bool {
        self.origin == EndpointOrigin::Dns
    }
}

impl fmt::Display for ResolvedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host == self.addr.ip().to_string() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}({})", self.host, self.addr)
        }
    }
}

/// 名称解析抽象。
#[async_trait]
pub trait EndpointResolver: Send + Sync + 'static {
    /// 将端点解析为候选套接字地址，至少返回一个，否则返回 `Resolution` 错误。
    async fn resolve(&self, endpoint: &Endpoint) -> Result<Vec<SocketAddr>, ConnectionError>;
}

/// 默认解析器：IP 字面量直接返回，其余交给 `tokio::net::lookup_host`。
#[derive(Clone, Copy, Debug, Default)]
pub struct DnsResolver;

#[async_trait]
impl EndpointResolver for DnsResolver {
    async fn resolve(&self, endpoint: &Endpoint) -> Result<Vec<SocketAddr>, ConnectionError> {
        if let Some(ip) = endpoint.ip() {
            return Ok(vec![SocketAddr::new(ip, endpoint.port)]);
        }
        let addrs: Vec<SocketAddr> =
            tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
                .await
                .map_err(|err| ConnectionError::Resolution {
                    endpoint: endpoint.to_string(),
                    detail: err.to_string(),
                })?
                .collect();
        if addrs.is_empty() {
            return Err(ConnectionError::Resolution {
                endpoint: endpoint.to_string(),
                detail: "no addresses returned".into(),
            });
        }
        Ok(addrs)
    }
}

/// 解析端点并取第一个地址，附带来源标记。
pub(crate) async fn resolve_one(
    resolver: &dyn EndpointResolver,
    endpoint: &Endpoint,
    origin_if_ip: EndpointOrigin,
) -> Result<ResolvedEndpoint, ConnectionError> {
    let origin = if endpoint.is_dns() {
        EndpointOrigin::Dns
    } else {
        origin_if_ip
    };
    let addrs = resolver.resolve(endpoint).await?;
    let addr = addrs
        .into_iter()
        .next()
        .ok_or_else(|| ConnectionError::Resolution {
            endpoint: endpoint.to_string(),
            detail: "no addresses returned".into(),
        })?;
    Ok(ResolvedEndpoint::new(addr, endpoint.host.clone(), origin))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_forms() {
        let v4: Endpoint = "127.0.0.1:1113".parse().expect("v4");
        assert_eq!(v4.port, 1113);
        assert!(!v4.is_dns());

        let v6: Endpoint = "[::1]:2113".parse().expect("v6");
        assert_eq!(v6.ip(), Some("::1".parse().expect("ip")));
        assert_eq!(v6.to_string(), "[::1]:2113");

        let dns: Endpoint = "node1.cluster.local:1113".parse().expect("dns");
        assert!(dns.is_dns());

        assert!("no-port".parse::<Endpoint>().is_err());
        assert!(":1113".parse::<Endpoint>().is_err());
        assert!("host:99999".parse::<Endpoint>().is_err());
    }

    #[tokio::test]
    async fn dns_resolver_short_circuits_ip_literals() {
        let endpoint = Endpoint::new("10.1.2.3", 1113);
        let resolved = resolve_one(&DnsResolver, &endpoint, EndpointOrigin::Static)
            .await
            .expect("IP 字面量无需查询 DNS");
        assert_eq!(resolved.addr, "10.1.2.3:1113".parse().expect("addr"));
        assert_eq!(resolved.origin, EndpointOrigin::Static);
        assert!(!resolved.is_dns_derived());
    }
}
