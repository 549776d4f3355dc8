//! # ledgerlink-transport-tcp
//!
//! ## 定位与职责（Why）
//! - 为 `ledgerlink-core` 的 [`Connector`](ledgerlink_core::Connector) 与
//!   [`GossipClient`](ledgerlink_core::GossipClient) 提供基于 Tokio 的 TCP/TLS 落地实现；
//! - 引擎本身不含任何套接字代码，生产部署只需把 [`TcpConnector`] 与 [`TcpGossipClient`]
//!   注入 [`ConnectionBuilder`](ledgerlink_core::ConnectionBuilder)。
//!
//! ## 模块划分（What）
//! - `codec`：长度前缀帧与请求/应答/gossip 消息体编码；
//! - `channel`：[`FramedLink`] 全双工帧链路与 [`TcpSocketConfig`] 套接字选项；
//! - `tls`：`rustls`（ring 后端）客户端配置与可选的“跳过证书校验”；
//! - `connector` / `gossip`：两个 trait 的实现；
//! - `error` / `util`：IO 错误分类与带时限执行的内部工具。
//!
//! ## 使用示例（How）
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use ledgerlink_core::{ConnectionBuilder, EventData, ExpectedVersion};
//! use ledgerlink_transport_tcp::{TcpConnector, TcpGossipClient};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let connection = ConnectionBuilder::from_connection_string("ConnectTo=tcp://127.0.0.1:1113")?
//!     .connector(Arc::new(TcpConnector::new()))
//!     .gossip(Arc::new(TcpGossipClient::new(Duration::from_secs(1))))
//!     .build()?;
//! connection.connect().await?;
//! connection
//!     .append_to_stream("orders", ExpectedVersion::Any, vec![EventData::json("Placed", "{}")])
//!     .await?;
//! connection.close().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod codec;
pub mod connector;
mod error;
pub mod gossip;
pub mod tls;
mod util;

pub use channel::{ByteStream, FramedLink, TcpSocketConfig};
pub use codec::{Command, Frame, MAX_FRAME_LEN};
pub use connector::TcpConnector;
pub use error::CodecError;
pub use gossip::TcpGossipClient;
pub use tls::TlsClientFactory;
