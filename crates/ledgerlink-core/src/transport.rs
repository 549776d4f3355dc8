//! # transport：物理链路契约
//!
//! ## 核心意图（Why）
//! - 控制器只依赖两个 trait：[`Connector`] 负责“建立一条链路”，[`Link`] 负责“在已建立的链路上收发消息”；
//!   TCP/TLS 实现位于 `ledgerlink-transport-tcp`，内存模拟实现位于 `test_util`；
//! - 建连超时由控制器统一施加，实现方无需自行计时，但可以把 [`LinkOptions::connection_timeout`]
//!   用于底层 socket 选项。
//!
//! ## 行为契约（What）
//! - `send`/`receive` 可由两个不同任务并发调用，实现需保证二者互不阻塞；
//! - `receive` 在对端正常关闭时返回 `Transport { kind: Closed, .. }`；
//! - `close` 幂等，调用后挂起中的 `receive` 应尽快返回错误。

use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;

use crate::{
    endpoint::ResolvedEndpoint,
    error::ConnectionError,
    protocol::{Request, Response},
    settings::ConnectionSettings,
};

/// TLS 相关选项。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TlsOptions {
    /// 握手时使用的服务器名称；为空时取端点主机名。
    pub target_host: Option<String>,
    /// 是否校验服务端证书链。
    pub validate_server: bool,
}

/// 建链参数。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkOptions {
    pub connection_timeout: Duration,
    pub tls: Option<TlsOptions>,
}

impl LinkOptions {
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        let tls = settings.use_tls.then(|| TlsOptions {
            target_host: settings.tls_target_host.clone(),
            validate_server: settings.validate_server_certificate,
        });
        Self {
            connection_timeout: settings.connection_timeout,
            tls,
        }
    }
}

/// 建立物理链路的工厂。
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(
        &self,
        endpoint: &ResolvedEndpoint,
        options: &LinkOptions,
    ) -> Result<Box<dyn Link>, ConnectionError>;
}

/// 一条已建立的双向消息链路。
#[async_trait]
pub trait Link: Send + Sync + 'static {
    fn remote(&self) -> SocketAddr;

    async fn send(&self, request: Request) -> Result<(), ConnectionError>;

    async fn receive(&self) -> Result<Response, ConnectionError>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_options_follow_settings() {
        let plain = LinkOptions::from_settings(&ConnectionSettings::default());
        assert!(plain.tls.is_none());

        let settings = ConnectionSettings::builder()
            .use_tls(true)
            .set_tls_target_host("db.internal")
            .disable_server_certificate_validation()
            .build()
            .expect("配置合法");
        let options = LinkOptions::from_settings(&settings);
        assert_eq!(
            options.tls,
            Some(TlsOptions {
                target_host: Some("db.internal".into()),
                validate_server: false,
            })
        );
    }
}
