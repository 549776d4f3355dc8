//! 集群发现与 Leader 跟随
//!
//! - **核心目标 (Why)**：验证 gossip 发现按偏好选中节点、结果在集群不变时稳定、
//!   全部种子无应答时以 `DiscoveryExhausted` 结束，以及 Leader 变更或 `NotLeader` 应答后连接跟随新 Leader；
//! - **边界 (What)**：内存集群的全部节点共享同一份存储，因此切换 Leader 后写入仍能延续版本号。

mod support;

use std::{sync::Arc, time::Duration};

use ledgerlink_core::{
    ClusterDiscoverer, ConnectTarget, ConnectionBuilder, ConnectionError, ConnectionEvent,
    ConnectionEventKind, ConnectionSettings, EventData, ExpectedVersion, NodeRole,
    test_util::{InMemoryCluster, NODE_GOSSIP_PORT, StaticResolver},
};
use support::{EventRecorder, clustered, single_node};

fn three_nodes() -> (InMemoryCluster, Vec<ledgerlink_core::test_util::NodeHandle>) {
    let cluster = InMemoryCluster::new();
    let nodes = vec![
        cluster.add_node(NodeRole::Follower),
        cluster.add_node(NodeRole::Leader),
        cluster.add_node(NodeRole::Follower),
    ];
    (cluster, nodes)
}

fn fast_discovery() -> ConnectionSettings {
    ConnectionSettings::builder()
        .set_max_discover_attempts(3)
        .set_discover_attempt_delay(Duration::from_millis(50))
        .set_gossip_timeout(Duration::from_millis(100))
        .set_reconnection_delay_to(Duration::from_millis(20))
        .build()
        .expect("配置合法")
}

fn discoverer(cluster: &InMemoryCluster, settings: ConnectionSettings) -> ClusterDiscoverer {
    ClusterDiscoverer::new(
        ConnectTarget::GossipSeeds(cluster.gossip_seeds()),
        Arc::new(settings),
        cluster.gossip(),
        Arc::new(StaticResolver::new()),
    )
}

#[tokio::test(start_paused = true)]
async fn discovery_picks_the_leader_and_is_stable() {
    let (cluster, nodes) = three_nodes();
    let discoverer = discoverer(&cluster, fast_discovery());

    let first = discoverer.discover(None).await.expect("发现 Leader");
    assert_eq!(first.addr, nodes[1].tcp_addr());
    assert_eq!(first.role, Some(NodeRole::Leader));

    let second = discoverer.discover(None).await.expect("再次发现");
    assert_eq!(second.addr, first.addr, "集群不变时结果稳定");
    assert_eq!(discoverer.known_members().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn discovery_honours_follower_preference() {
    let (cluster, nodes) = three_nodes();
    let settings = ConnectionSettings::builder()
        .prefer_follower_node()
        .perform_on_any_node()
        .build()
        .expect("配置合法");
    let connection = clustered(&cluster, settings);
    connection.connect().await.expect("connect");
    let endpoint = connection
        .wait_connected(Duration::from_secs(5))
        .await
        .expect("连接到 Follower");
    assert_ne!(endpoint.addr, nodes[1].tcp_addr());
    assert_eq!(endpoint.role, Some(NodeRole::Follower));

    connection
        .append_to_stream("any-node", ExpectedVersion::Any, vec![EventData::json("e", "{}")])
        .await
        .expect("允许任意节点写入");
    connection.close().await;
}

#[tokio::test(start_paused = true)]
async fn discovery_is_exhausted_when_nobody_answers() {
    let (cluster, nodes) = three_nodes();
    for node in &nodes {
        node.set_responsive(false);
    }
    let discoverer = discoverer(&cluster, fast_discovery());
    let err = discoverer.discover(None).await.expect_err("无人应答");
    assert!(matches!(err, ConnectionError::DiscoveryExhausted { attempts: 3 }));
    for node in &nodes {
        assert_eq!(node.gossip_queries(), 3, "每轮都查询全部种子");
    }
}

#[tokio::test(start_paused = true)]
async fn exhausted_discovery_counts_as_a_failed_attempt() {
    let (cluster, nodes) = three_nodes();
    for node in &nodes {
        node.stop();
    }
    let settings = ConnectionSettings::builder()
        .limit_reconnections_to(1)
        .set_max_discover_attempts(2)
        .set_discover_attempt_delay(Duration::from_millis(10))
        .build()
        .expect("配置合法");
    let connection = clustered(&cluster, settings);
    let mut recorder = EventRecorder::attach(&connection);
    connection.connect().await.expect("connect");

    match recorder.next_of(ConnectionEventKind::ErrorOccurred).await {
        ConnectionEvent::ErrorOccurred { error } => {
            assert!(matches!(error, ConnectionError::DiscoveryExhausted { attempts: 2 }));
        }
        other => panic!("意外事件：{other:?}"),
    }
    recorder.next_of(ConnectionEventKind::Closed).await;
    assert_eq!(recorder.count(ConnectionEventKind::ErrorOccurred), 2);
    assert!(nodes.iter().all(|node| node.open_attempts() == 0));
}

#[tokio::test(start_paused = true)]
async fn connection_follows_a_leader_change() {
    let (cluster, nodes) = three_nodes();
    let connection = clustered(&cluster, fast_discovery());
    let mut recorder = EventRecorder::attach(&connection);
    connection.connect().await.expect("connect");
    let first = connection
        .wait_connected(Duration::from_secs(5))
        .await
        .expect("连接到 Leader");
    assert_eq!(first.addr, nodes[1].tcp_addr());
    connection
        .append_to_stream("ledger", ExpectedVersion::NoStream, vec![EventData::json("e", "{}")])
        .await
        .expect("首次写入");

    nodes[1].stop();
    nodes[2].promote();
    recorder.next_of(ConnectionEventKind::Disconnected).await;
    match recorder.next_of(ConnectionEventKind::Connected).await {
        ConnectionEvent::Connected { endpoint } => {
            assert_eq!(endpoint.addr, nodes[2].tcp_addr());
        }
        other => panic!("意外事件：{other:?}"),
    }

    let result = connection
        .append_to_stream("ledger", ExpectedVersion::Exact(0), vec![EventData::json("e", "{}")])
        .await
        .expect("新 Leader 上继续写入");
    assert_eq!(result.next_expected_version, 1);
    connection.close().await;
}

#[tokio::test(start_paused = true)]
async fn not_leader_reply_redirects_to_advertised_leader() {
    let (cluster, nodes) = three_nodes();
    let connection = single_node(
        &cluster,
        ConnectTarget::Single(nodes[0].tcp_endpoint()),
        ConnectionSettings::default(),
    );
    let mut recorder = EventRecorder::attach(&connection);
    connection.connect().await.expect("connect");

    let result = connection
        .append_to_stream("redirected", ExpectedVersion::Any, vec![EventData::json("e", "{}")])
        .await
        .expect("改连 Leader 后写入成功");
    assert!(result.log_position.commit > 0);
    assert_eq!(
        connection.connected_endpoint().map(|endpoint| endpoint.addr),
        Some(nodes[1].tcp_addr())
    );
    assert_eq!(nodes[0].open_attempts(), 1);
    assert_eq!(nodes[1].open_attempts(), 1);
    assert_eq!(
        recorder.count(ConnectionEventKind::Reconnecting),
        0,
        "改连 Leader 不计为失败的重连"
    );
    connection.close().await;
}

#[tokio::test(start_paused = true)]
async fn cluster_dns_resolves_gossip_candidates() {
    let (cluster, nodes) = three_nodes();
    let addrs = nodes.iter().map(|node| node.tcp_addr()).collect();
    let resolver = Arc::new(StaticResolver::new().with_host("cluster.local", addrs));
    let connection = ConnectionBuilder::new(ConnectTarget::ClusterDns {
        dns: "cluster.local".into(),
        gossip_port: NODE_GOSSIP_PORT,
    })
    .settings(fast_discovery())
    .connector(cluster.connector())
    .gossip(cluster.gossip())
    .resolver(resolver.clone())
    .build()
    .expect("构建连接");
    connection.connect().await.expect("connect");

    let endpoint = connection
        .wait_connected(Duration::from_secs(5))
        .await
        .expect("经 DNS 发现 Leader");
    assert_eq!(endpoint.addr, nodes[1].tcp_addr());
    assert!(resolver.lookups() >= 1);
    connection.close().await;
}
