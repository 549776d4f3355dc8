//! 回环测试用的极简帧服务端
//!
//! - **意图 (Why)**：传输 crate 的测试需要一个说同一套帧协议的对端；
//!   这里复用 [`FramedLink`] 与 `codec` 的服务端方向函数，最多几十行即可覆盖追加、心跳与 gossip；
//! - **边界 (What)**：每个流只维护一个版本号，位置按全局计数递增；不实现乐观并发以外的任何存储语义。

#![allow(dead_code)]

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use ledgerlink_core::{
    ClusterMember, Endpoint, NodeRole, Position, RequestBody, Response, ResponseBody, StreamState,
    WriteResult,
};
use ledgerlink_transport_tcp::{
    Command, FramedLink,
    codec::{decode_request, encode_gossip_reply, encode_response},
};
use rustls::{
    ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
};
use tokio::{net::TcpListener, sync::Mutex, task::JoinHandle};
use tokio_rustls::TlsAcceptor;

#[derive(Default)]
struct Store {
    versions: HashMap<String, u64>,
    commit: u64,
}

/// 正在监听的测试服务端；析构时停止接受新连接。
pub struct TestServer {
    pub addr: SocketAddr,
    accepted: Arc<std::sync::atomic::AtomicUsize>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::from(self.addr)
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// 启动服务端；`tls` 非空时先完成握手再进入帧循环。
pub async fn spawn_server(tls: Option<TlsAcceptor>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("绑定回环端口");
    let addr = listener.local_addr().expect("本地地址");
    let store = Arc::new(Mutex::new(Store::default()));
    let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = accepted.clone();

    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let store = store.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                let link = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => FramedLink::new(tls_stream, peer),
                        Err(_) => return,
                    },
                    None => FramedLink::new(stream, peer),
                };
                serve(link, addr, store).await;
            });
        }
    });

    TestServer {
        addr,
        accepted,
        task,
    }
}

async fn serve(link: FramedLink, advertised: SocketAddr, store: Arc<Mutex<Store>>) {
    while let Ok(frame) = link.receive_frame().await {
        let correlation = frame.correlation;
        if frame.command == Command::GossipQuery {
            let members = vec![ClusterMember {
                tcp_endpoint: Endpoint::from(advertised),
                gossip_endpoint: Endpoint::from(advertised),
                role: NodeRole::Leader,
                is_alive: true,
                writer_checkpoint: 1,
            }];
            let reply = encode_gossip_reply(correlation, &members).expect("编码 gossip 应答");
            if link.send_frame(&reply).await.is_err() {
                return;
            }
            continue;
        }

        let Ok(request) = decode_request(frame) else {
            return;
        };
        let body = match request.body {
            RequestBody::HeartbeatRequest => ResponseBody::HeartbeatResponse,
            RequestBody::HeartbeatResponse => continue,
            RequestBody::Append(append) => {
                let mut store = store.lock().await;
                let state = store
                    .versions
                    .get(&append.stream)
                    .map_or(StreamState::NoStream, |version| StreamState::At(*version));
                if !append.expected_version.matches(state) {
                    ResponseBody::WrongExpectedVersion { current: state }
                } else {
                    let count = append.events.len() as u64;
                    let next = match state {
                        StreamState::NoStream => count.saturating_sub(1),
                        StreamState::At(version) => version + count,
                    };
                    store.versions.insert(append.stream.clone(), next);
                    store.commit += 100;
                    let commit = store.commit;
                    ResponseBody::AppendCompleted(WriteResult {
                        next_expected_version: next,
                        log_position: Position::new(commit, commit),
                    })
                }
            }
        };
        let response = Response { correlation, body };
        let frame = encode_response(&response).expect("编码应答");
        if link.send_frame(&frame).await.is_err() {
            return;
        }
    }
}

/// 自签名证书及其服务端配置。
pub struct SelfSigned {
    pub certificate: CertificateDer<'static>,
    pub acceptor: TlsAcceptor,
}

pub fn self_signed(host: &str) -> SelfSigned {
    let certified = rcgen::generate_simple_self_signed(vec![host.to_owned()]).expect("生成自签名证书");
    let certificate = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .expect("协议版本")
    .with_no_client_auth()
    .with_single_cert(vec![certificate.clone()], key)
    .expect("服务端 TLS 配置");
    SelfSigned {
        certificate,
        acceptor: TlsAcceptor::from(Arc::new(config)),
    }
}
