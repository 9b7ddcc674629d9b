//! SOCKS5 客户端隧道协商。

mod filter;
mod protocol;

pub use filter::Socks5ConnectFilter;
pub use protocol::{Credentials, SocksError, TargetAddr};
