use std::fmt;
use std::sync::Arc;

use ledgerlink_core::{ConnectionError, ResolvedEndpoint, TlsOptions, TransportErrorKind};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

use crate::error::HANDSHAKE;

/// 客户端 TLS 配置工厂。
///
/// # 设计动机（Why）
/// - 连接设置只给出“是否启用 TLS、握手用哪个服务器名、是否校验证书”三项开关，
///   这里负责把它们翻译为 `rustls::ClientConfig`；
/// - 密码学后端固定为 `ring` 并通过 `builder_with_provider` 显式注入，
///   不依赖进程级默认 Provider，库使用者无需额外初始化。
///
/// # 核心契约（What）
/// - `roots` 为信任锚；默认空，生产部署需通过 [`TlsClientFactory::with_root_certificates`]
///   或 [`TlsClientFactory::add_root_certificate`] 注入；
/// - `validate_server = false` 时跳过证书链与主机名校验，但握手签名仍按 Provider 的算法校验，
///   仅用于自签名测试集群；
/// - 两份 `ClientConfig` 在首次使用时构建并缓存，后续建连共享同一 `Arc`。
///
/// # 风险提示（Trade-offs & Gotchas）
/// - 关闭校验后链路不再防中间人，调用方应只在受控网络中使用。
#[derive(Clone)]
pub struct TlsClientFactory {
    provider: Arc<CryptoProvider>,
    roots: Arc<RootCertStore>,
    verifying: Arc<std::sync::OnceLock<Arc<ClientConfig>>>,
    permissive: Arc<std::sync::OnceLock<Arc<ClientConfig>>>,
}

impl TlsClientFactory {
    pub fn new() -> Self {
        Self::with_root_certificates(RootCertStore::empty())
    }

    pub fn with_root_certificates(roots: RootCertStore) -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            roots: Arc::new(roots),
            verifying: Arc::default(),
            permissive: Arc::default(),
        }
    }

    /// 追加一个信任锚（DER 编码）。
    pub fn add_root_certificate(
        mut self,
        certificate: CertificateDer<'static>,
    ) -> Result<Self, ConnectionError> {
        let mut roots = (*self.roots).clone();
        roots.add(certificate).map_err(|err| {
            ConnectionError::transport(HANDSHAKE.name, TransportErrorKind::Tls, err.to_string())
        })?;
        self.roots = Arc::new(roots);
        self.verifying = Arc::default();
        Ok(self)
    }

    /// 取得与 `options` 对应的客户端配置。
    pub fn client_config(&self, options: &TlsOptions) -> Result<Arc<ClientConfig>, ConnectionError> {
        let slot = if options.validate_server {
            &self.verifying
        } else {
            &self.permissive
        };
        if let Some(config) = slot.get() {
            return Ok(config.clone());
        }
        let config = Arc::new(self.build(options.validate_server)?);
        Ok(slot.get_or_init(|| config).clone())
    }

    fn build(&self, validate_server: bool) -> Result<ClientConfig, ConnectionError> {
        let builder = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|err| {
                ConnectionError::transport(HANDSHAKE.name, TransportErrorKind::Tls, err.to_string())
            })?;
        let config = if validate_server {
            builder
                .with_root_certificates(self.roots.clone())
                .with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification {
                    provider: self.provider.clone(),
                }))
                .with_no_client_auth()
        };
        Ok(config)
    }
}

impl Default for TlsClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TlsClientFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsClientFactory")
            .field("roots", &self.roots.len())
            .finish_non_exhaustive()
    }
}

/// 握手使用的服务器名称：优先取配置的目标主机，否则取端点的原始主机名。
pub(crate) fn server_name(
    options: &TlsOptions,
    endpoint: &ResolvedEndpoint,
) -> Result<ServerName<'static>, ConnectionError> {
    let host = options
        .target_host
        .clone()
        .unwrap_or_else(|| endpoint.host.clone());
    ServerName::try_from(host.clone()).map_err(|err| {
        ConnectionError::transport(
            HANDSHAKE.name,
            TransportErrorKind::Tls,
            format!("invalid server name `{host}`: {err}"),
        )
    })
}

/// 接受任意服务端证书的校验器，握手签名仍按 Provider 支持的算法验证。
#[derive(Debug)]
struct SkipServerVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use ledgerlink_core::EndpointOrigin;

    use super::*;

    fn endpoint(host: &str) -> ResolvedEndpoint {
        ResolvedEndpoint::new(
            SocketAddr::from(([10, 0, 0, 1], 1113)),
            host,
            EndpointOrigin::Dns,
        )
    }

    #[test]
    fn target_host_overrides_endpoint_host() {
        let options = TlsOptions {
            target_host: Some("ledger.internal".into()),
            validate_server: true,
        };
        let name = server_name(&options, &endpoint("node-1.local")).expect("合法名称");
        assert_eq!(name.to_str(), "ledger.internal");

        let fallback = TlsOptions {
            target_host: None,
            validate_server: true,
        };
        let name = server_name(&fallback, &endpoint("node-1.local")).expect("合法名称");
        assert_eq!(name.to_str(), "node-1.local");
    }

    #[test]
    fn configs_are_cached_per_validation_mode() {
        let factory = TlsClientFactory::new();
        let strict = TlsOptions {
            target_host: None,
            validate_server: true,
        };
        let lax = TlsOptions {
            target_host: None,
            validate_server: false,
        };
        let first = factory.client_config(&strict).expect("校验模式");
        let second = factory.client_config(&strict).expect("校验模式");
        assert!(Arc::ptr_eq(&first, &second));
        let permissive = factory.client_config(&lax).expect("跳过校验模式");
        assert!(!Arc::ptr_eq(&first, &permissive));
    }
}
