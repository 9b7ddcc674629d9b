#![deny(unsafe_code)]
#![doc = r#"
# fai-transport-tls

## 设计背景（Why）
- 为 `fai-transport-tcp` 上的连接提供 TLS 加密，而不改动反应器：TLS 以过滤器的形式叠加在链上，
  握手记录与应用数据都经由它下面的过滤器与套接字收发；
- 证书、信任根与 ALPN 全部由调用方通过 rustls 配置给出，本 crate 不选择加密后端。

## 契约说明（What）
- [`TlsFilter::client`] / [`TlsFilter::server`]：两种模式共用一套读写逻辑；
- 握手完成后才向上转发 `on_connect`，此前的明文写出被扣留；
- 所有失败以 `protocol.tls` 码值报告，底层原因保存在 [`TlsError`] 中。
"#]

mod error;
mod filter;

pub use error::TlsError;
pub use filter::{Handshake, TlsFilter};
