//! 明文 TCP 回环：帧往返、gossip 查询与完整连接
//!
//! - **核心目标 (Why)**：确认 [`TcpConnector`] 建出的链路能与说同一帧协议的服务端完成追加往返，
//!   [`TcpGossipClient`] 能取回成员表，且两者接入 `ConnectionBuilder` 后引擎可端到端工作；
//! - **手法 (How)**：测试服务端监听 `127.0.0.1:0`，同一端口同时应答数据与 gossip 帧。

mod support;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use ledgerlink_core::{
    AppendRequest, ConnectTarget, ConnectionBuilder, ConnectionError, ConnectionSettings,
    Connector, CorrelationId, EndpointOrigin, EventData, ExpectedVersion, GossipClient,
    Link, LinkOptions, NodeRole, Request, RequestBody, ResolvedEndpoint, ResponseBody, StreamState,
    TransportErrorKind,
};
use ledgerlink_transport_tcp::{TcpConnector, TcpGossipClient};
use support::spawn_server;

fn resolved(addr: SocketAddr) -> ResolvedEndpoint {
    ResolvedEndpoint::new(addr, addr.ip().to_string(), EndpointOrigin::Static)
}

fn plain() -> LinkOptions {
    LinkOptions {
        connection_timeout: Duration::from_secs(2),
        tls: None,
    }
}

fn append(correlation: u64, expected: ExpectedVersion) -> Request {
    Request {
        correlation: CorrelationId::new(correlation),
        body: RequestBody::Append(AppendRequest {
            stream: "loopback".into(),
            expected_version: expected,
            events: vec![EventData::json("Pinged", r#"{"n":1}"#)],
            require_leader: true,
            credentials: None,
        }),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn framed_append_round_trip() {
    let server = spawn_server(None).await;
    let link = TcpConnector::new()
        .open(&resolved(server.addr), &plain())
        .await
        .expect("建立链路");
    assert_eq!(link.remote(), server.addr);

    link.send(append(1, ExpectedVersion::NoStream)).await.expect("发送追加");
    let first = link.receive().await.expect("收到应答");
    assert_eq!(first.correlation, CorrelationId::new(1));
    let ResponseBody::AppendCompleted(result) = first.body else {
        panic!("意外应答：{:?}", first.body);
    };
    assert_eq!(result.next_expected_version, 0);
    assert!(result.log_position.commit > 0);

    link.send(append(2, ExpectedVersion::NoStream)).await.expect("再次发送");
    let second = link.receive().await.expect("收到应答");
    assert_eq!(
        second.body,
        ResponseBody::WrongExpectedVersion {
            current: StreamState::At(0)
        }
    );

    link.send(Request {
        correlation: CorrelationId::new(3),
        body: RequestBody::HeartbeatRequest,
    })
    .await
    .expect("发送心跳");
    let heartbeat = link.receive().await.expect("心跳应答");
    assert_eq!(heartbeat.body, ResponseBody::HeartbeatResponse);
    link.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_connection_is_a_transport_error() {
    let server = spawn_server(None).await;
    let addr = server.addr;
    drop(server);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = TcpConnector::new()
        .open(&resolved(addr), &plain())
        .await
        .err().expect("端口已关闭");
    assert!(
        matches!(
            err,
            ConnectionError::Transport {
                kind: TransportErrorKind::Refused,
                ..
            }
        ),
        "意外错误：{err:?}"
    );
    assert!(err.is_transient());
}

#[tokio::test(flavor = "multi_thread")]
async fn gossip_client_reads_the_member_list() {
    let server = spawn_server(None).await;
    let client = TcpGossipClient::new(Duration::from_secs(1));

    let members = client
        .cluster_members(&resolved(server.addr))
        .await
        .expect("gossip 应答");
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].role, NodeRole::Leader);
    assert_eq!(members[0].tcp_endpoint, server.endpoint());
    assert!(members[0].is_alive);
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_appends_through_tcp_transport() {
    let server = spawn_server(None).await;
    let connection = ConnectionBuilder::new(ConnectTarget::Single(server.endpoint()))
        .connector(Arc::new(TcpConnector::new()))
        .build()
        .expect("构建连接");
    connection.connect().await.expect("connect");
    connection
        .wait_connected(Duration::from_secs(5))
        .await
        .expect("回环在线");

    let first = connection
        .append_to_stream("e2e", ExpectedVersion::NoStream, vec![EventData::json("A", "{}")])
        .await
        .expect("首次追加");
    let second = connection
        .append_to_stream("e2e", ExpectedVersion::Exact(0), vec![EventData::json("B", "{}")])
        .await
        .expect("二次追加");
    assert_eq!(second.next_expected_version, 1);
    assert!(second.log_position > first.log_position);
    connection.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_discovers_the_leader_over_gossip() {
    let server = spawn_server(None).await;
    let settings = ConnectionSettings::builder()
        .set_gossip_timeout(Duration::from_secs(1))
        .set_max_discover_attempts(3)
        .build()
        .expect("配置合法");
    let connection = ConnectionBuilder::new(ConnectTarget::GossipSeeds(vec![server.endpoint()]))
        .settings(settings)
        .connector(Arc::new(TcpConnector::new()))
        .gossip(Arc::new(TcpGossipClient::new(Duration::from_secs(1))))
        .build()
        .expect("构建连接");
    connection.connect().await.expect("connect");

    let endpoint = connection
        .wait_connected(Duration::from_secs(5))
        .await
        .expect("经 gossip 发现 Leader");
    assert_eq!(endpoint.addr, server.addr);
    assert_eq!(endpoint.origin, EndpointOrigin::Gossip);

    connection
        .append_to_stream("discovered", ExpectedVersion::Any, vec![EventData::json("C", "{}")])
        .await
        .expect("追加成功");
    connection.close().await;
    assert!(server.accepted() >= 2, "gossip 与数据各用一条链路");
}
