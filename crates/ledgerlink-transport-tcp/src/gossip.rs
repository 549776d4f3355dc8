use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ledgerlink_core::{
    ClusterMember, ConnectionError, CorrelationId, GossipClient, LinkOptions, ResolvedEndpoint,
    TransportErrorKind,
};
use tracing::debug;

use crate::{codec, connector::TcpConnector, error::GOSSIP};

/// 通过 gossip 端口查询成员表的客户端。
///
/// - 每次查询新建一条明文 TCP 链路，发送 `GossipQuery` 帧并等待同一关联 ID 的 `GossipReply`，
///   随后关闭链路；
/// - 建连与应答各受 `timeout` 约束；发现器外层的 gossip 超时仍然生效，取二者中更早者。
#[derive(Debug)]
pub struct TcpGossipClient {
    connector: TcpConnector,
    timeout: Duration,
    next_correlation: AtomicU64,
}

impl TcpGossipClient {
    pub fn new(timeout: Duration) -> Self {
        Self::with_connector(TcpConnector::new(), timeout)
    }

    pub fn with_connector(connector: TcpConnector, timeout: Duration) -> Self {
        Self {
            connector,
            timeout,
            next_correlation: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl GossipClient for TcpGossipClient {
    async fn cluster_members(
        &self,
        gossip: &ResolvedEndpoint,
    ) -> Result<Vec<ClusterMember>, ConnectionError> {
        let options = LinkOptions {
            connection_timeout: self.timeout,
            tls: None,
        };
        let link = self.connector.dial(gossip, &options).await?;
        let correlation = CorrelationId::new(self.next_correlation.fetch_add(1, Ordering::Relaxed));

        let exchange = async {
            link.send_frame(&codec::gossip_query(correlation)).await?;
            loop {
                let frame = link.receive_frame().await?;
                if frame.correlation == correlation {
                    return Ok::<_, ConnectionError>(codec::decode_gossip_reply(frame)?);
                }
                debug!(%gossip, stale = %frame.correlation, "ignoring unrelated gossip frame");
            }
        };
        let result = if self.timeout.is_zero() {
            exchange.await
        } else {
            tokio::time::timeout(self.timeout, exchange)
                .await
                .unwrap_or_else(|_| {
                    Err(ConnectionError::transport(
                        GOSSIP.name,
                        TransportErrorKind::Io,
                        format!("{}: no reply within {:?}", GOSSIP.message, self.timeout),
                    ))
                })
        };
        link.shutdown().await;
        let members = result?;
        debug!(%gossip, members = members.len(), "gossip reply received");
        Ok(members)
    }
}
