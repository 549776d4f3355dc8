use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use ledgerlink_core::{ConnectionError, Link, Request, Response};
use socket2::{SockRef, TcpKeepalive};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{Mutex as AsyncMutex, watch},
};
use tracing::trace;

use crate::{
    codec::{self, Frame},
    error::{READ, WRITE, closed_error, map_io_error},
};

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// TCP 套接字级配置项，实现对内核行为的显式控制。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 长连接要尽快发现半死的对端，因此默认开启 `SO_KEEPALIVE`；应用层心跳仍是主判据，
///   keepalive 只兜底“进程已消失但没有 FIN”的情况；
/// - 请求帧很小且对时延敏感，默认关闭 Nagle（`TCP_NODELAY`）。
///
/// ## 核心逻辑（How）
/// - `keepalive` 为 `Some(idle)` 时通过 `socket2::SockRef::set_tcp_keepalive` 设置空闲探测时长；
/// - `linger` 为 `Some(dur)` 时写入 `SO_LINGER`，关闭阶段超过 `dur` 未发送完即以 RST 释放；
/// - `nodelay` 走 Tokio 自带的 setter。
///
/// ## 契约说明（What）
/// - **前置条件**：调用 `apply` 前，`TcpStream` 必须已成功创建；
/// - **后置条件**：若 `apply` 返回 `Ok(())`，则全部套接字选项已落地。
///
/// ## 设计取舍与注意事项（Trade-offs）
/// - keepalive 精度依赖平台（Linux 以秒为单位），设置过小会放大探测流量。
#[derive(Clone, Debug)]
pub struct TcpSocketConfig {
    nodelay: bool,
    keepalive: Option<Duration>,
    linger: Option<Duration>,
}

impl TcpSocketConfig {
    pub const fn new() -> Self {
        Self {
            nodelay: true,
            keepalive: Some(Duration::from_secs(30)),
            linger: None,
        }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// 设置 keepalive 空闲时长，`None` 表示关闭。
    pub fn with_keepalive(mut self, idle: Option<Duration>) -> Self {
        self.keepalive = idle;
        self
    }

    /// 设置 `SO_LINGER` 超时时长。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    pub(crate) fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        let sock = SockRef::from(stream);
        if let Some(idle) = self.keepalive {
            sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }
        sock.set_linger(self.linger)
    }
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// 可装箱的双向字节流：明文 `TcpStream` 与 TLS 流共用同一套帧读写逻辑。
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type BoxedStream = Box<dyn ByteStream>;

struct FrameReader {
    half: ReadHalf<BoxedStream>,
    buffer: BytesMut,
}

impl FrameReader {
    async fn next_frame(&mut self) -> Result<Frame, ConnectionError> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buffer)? {
                return Ok(frame);
            }
            let read = self
                .half
                .read_buf(&mut self.buffer)
                .await
                .map_err(|err| map_io_error(READ, err))?;
            if read == 0 {
                return Err(closed_error(READ));
            }
        }
    }
}

/// 在任意字节流上收发长度前缀帧的双工链路。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 会话的读任务与写任务并发运行，因此读写必须能够同时进行；
///   这里以 `tokio::io::split` 拆出两个半部，各自由一把异步锁保护，实现真正的全双工；
/// - 同一个类型既作为客户端 [`Link`]（发请求、收应答），也可被测试服务端与 gossip 查询
///   直接用来收发原始 [`Frame`]。
///
/// ## 契约 (What)
/// - `send_frame`：编码并完整写出一帧后 `flush`；
/// - `receive_frame`：读出下一帧；对端关闭时返回 `Transport { kind: Closed }`；
/// - `close`：幂等；挂起中的 `receive_frame` 立即以“已关闭”返回，随后半关闭写端。
///
/// ## 注意事项 (Trade-offs)
/// - 读路径可被 `select!` 取消：`read_buf` 本身是取消安全的，已读入的半帧留在缓冲区中，
///   不会丢字节。
pub struct FramedLink {
    reader: AsyncMutex<FrameReader>,
    writer: AsyncMutex<WriteHalf<BoxedStream>>,
    remote: SocketAddr,
    closed: watch::Sender<bool>,
}

impl FramedLink {
    pub fn new<S>(stream: S, remote: SocketAddr) -> Self
    where
        S: ByteStream,
    {
        let boxed: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);
        let (closed, _) = watch::channel(false);
        Self {
            reader: AsyncMutex::new(FrameReader {
                half: read_half,
                buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            }),
            writer: AsyncMutex::new(write_half),
            remote,
            closed,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(closed_error(WRITE));
        }
        let mut wire = BytesMut::with_capacity(frame.payload.len() + 16);
        frame.encode(&mut wire)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&wire)
            .await
            .map_err(|err| map_io_error(WRITE, err))?;
        writer.flush().await.map_err(|err| map_io_error(WRITE, err))?;
        trace!(remote = %self.remote, command = ?frame.command, correlation = %frame.correlation, "frame sent");
        Ok(())
    }

    pub async fn receive_frame(&self) -> Result<Frame, ConnectionError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(closed_error(READ));
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            biased;
            _ = closed.changed() => Err(closed_error(READ)),
            frame = reader.next_frame() => frame,
        }
    }

    pub async fn shutdown(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            trace!(remote = %self.remote, error = %err, "shutdown of write half failed");
        }
    }
}

impl fmt::Debug for FramedLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedLink")
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Link for FramedLink {
    fn remote(&self) -> SocketAddr {
        self.remote
    }

    async fn send(&self, request: Request) -> Result<(), ConnectionError> {
        let frame = codec::encode_request(&request)?;
        self.send_frame(&frame).await
    }

    async fn receive(&self) -> Result<Response, ConnectionError> {
        let frame = self.receive_frame().await?;
        Ok(codec::decode_response(frame)?)
    }

    async fn close(&self) {
        self.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use ledgerlink_core::{CorrelationId, RequestBody, ResponseBody, TransportErrorKind};

    use super::*;

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn heartbeat_crosses_an_in_memory_duplex() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let client = FramedLink::new(client_io, loopback());
        let server = FramedLink::new(server_io, loopback());

        client
            .send(Request {
                correlation: CorrelationId::new(5),
                body: RequestBody::HeartbeatRequest,
            })
            .await
            .expect("发送心跳");
        let request = codec::decode_request(server.receive_frame().await.expect("收到帧"))
            .expect("解码请求");
        assert_eq!(request.body, RequestBody::HeartbeatRequest);

        let reply = codec::encode_response(&Response {
            correlation: request.correlation,
            body: ResponseBody::HeartbeatResponse,
        })
        .expect("编码应答");
        server.send_frame(&reply).await.expect("回写");
        let response = client.receive().await.expect("收到应答");
        assert_eq!(response.correlation, CorrelationId::new(5));
        assert_eq!(response.body, ResponseBody::HeartbeatResponse);
    }

    #[tokio::test]
    async fn close_interrupts_a_pending_receive() {
        let (client_io, _server_io) = tokio::io::duplex(64);
        let client = std::sync::Arc::new(FramedLink::new(client_io, loopback()));
        let receiver = client.clone();
        let pending = tokio::spawn(async move { receiver.receive().await });
        tokio::task::yield_now().await;

        client.close().await;
        client.close().await;
        let err = pending.await.expect("任务").expect_err("已关闭");
        assert!(matches!(
            err,
            ConnectionError::Transport {
                kind: TransportErrorKind::Closed,
                ..
            }
        ));
        assert!(client.send_frame(&codec::gossip_query(CorrelationId::new(1))).await.is_err());
    }

    #[tokio::test]
    async fn peer_eof_is_reported_as_closed() {
        let (client_io, server_io) = tokio::io::duplex(64);
        let client = FramedLink::new(client_io, loopback());
        drop(server_io);
        let err = client.receive().await.expect_err("对端关闭");
        assert!(matches!(
            err,
            ConnectionError::Transport {
                kind: TransportErrorKind::Closed,
                ..
            }
        ));
    }
}
