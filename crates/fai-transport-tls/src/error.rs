use std::io;

use fai_core::{CoreError, codes};
use thiserror::Error;

/// TLS 协商过程中的失败。
///
/// 所有变体最终都以 `protocol.tls` 码值进入过滤链的错误通知。
#[derive(Debug, Error)]
pub enum TlsError {
    /// 客户端模式给出的主机名不是合法的 SNI。
    #[error("invalid tls server name `{0}`")]
    InvalidServerName(String),
    /// 握手或记录层违反协议，包括证书校验失败。
    #[error("tls negotiation failed: {0}")]
    Negotiation(#[from] rustls::Error),
    /// 与 rustls 缓冲交换字节时失败。
    #[error("tls record io failed: {0}")]
    Io(#[from] io::Error),
    /// 收到密文时连接上还没有 TLS 会话。
    #[error("tls session missing; on_connect was never forwarded")]
    MissingSession,
}

impl From<TlsError> for CoreError {
    fn from(value: TlsError) -> Self {
        CoreError::new(codes::PROTOCOL_TLS, value.to_string()).with_cause(value)
    }
}
