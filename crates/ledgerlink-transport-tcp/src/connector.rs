use async_trait::async_trait;
use ledgerlink_core::{ConnectionError, Connector, Link, LinkOptions, ResolvedEndpoint};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::{
    channel::{FramedLink, TcpSocketConfig},
    error::{CONFIGURE, CONNECT, HANDSHAKE, map_io_error},
    tls::{self, TlsClientFactory},
    util::run_with_timeout,
};

/// 基于 Tokio 的 TCP/TLS 建链工厂。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 控制器只认识 [`Connector`]，本类型把“拨号、套接字选项、可选 TLS 握手、包装为帧链路”
///   收拢为一次 `open` 调用；
///
/// ## 逻辑（How）
/// - 拨号与握手各自受 `LinkOptions::connection_timeout` 约束（控制器外层还有一层整体超时）；
/// - 拨号成功后立即应用 [`TcpSocketConfig`]，失败按 `tcp configure` 上报；
/// - `LinkOptions::tls` 非空时，以 [`TlsClientFactory`] 产出的配置完成握手，
///   服务器名称优先取 `target_host`，否则取端点原始主机名。
///
/// ## 契约（What）
/// - 成功返回的链路已可立即收发帧；
/// - 所有失败均为 [`ConnectionError`]：超时为 `ConnectTimeout`，其余为 `Transport`，
///   握手阶段一律标记为 `Tls`。
#[derive(Clone, Debug, Default)]
pub struct TcpConnector {
    socket: TcpSocketConfig,
    tls: TlsClientFactory,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_socket_config(mut self, socket: TcpSocketConfig) -> Self {
        self.socket = socket;
        self
    }

    /// 替换 TLS 配置工厂，通常用于注入信任锚。
    pub fn with_tls(mut self, tls: TlsClientFactory) -> Self {
        self.tls = tls;
        self
    }

    pub fn socket_config(&self) -> &TcpSocketConfig {
        &self.socket
    }

    pub(crate) async fn dial(
        &self,
        endpoint: &ResolvedEndpoint,
        options: &LinkOptions,
    ) -> Result<FramedLink, ConnectionError> {
        let stream = run_with_timeout(
            CONNECT,
            endpoint,
            options.connection_timeout,
            TcpStream::connect(endpoint.addr),
        )
        .await?;
        self.socket
            .apply(&stream)
            .map_err(|err| map_io_error(CONFIGURE, err))?;

        let Some(tls_options) = &options.tls else {
            debug!(%endpoint, "tcp link established");
            return Ok(FramedLink::new(stream, endpoint.addr));
        };

        let config = self.tls.client_config(tls_options)?;
        let server_name = tls::server_name(tls_options, endpoint)?;
        let connector = TlsConnector::from(config);
        let tls_stream = run_with_timeout(
            HANDSHAKE,
            endpoint,
            options.connection_timeout,
            connector.connect(server_name, stream),
        )
        .await?;
        debug!(
            %endpoint,
            validate_server = tls_options.validate_server,
            "tls link established"
        );
        Ok(FramedLink::new(tls_stream, endpoint.addr))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(
        &self,
        endpoint: &ResolvedEndpoint,
        options: &LinkOptions,
    ) -> Result<Box<dyn Link>, ConnectionError> {
        let link = self.dial(endpoint, options).await?;
        Ok(Box::new(link))
    }
}
