#![deny(unsafe_code)]
#![doc = "fai-codecs: 运行在 `fai-core` 过滤链上的协议过滤器。"]
#![doc = ""]
#![doc = "- [`fai`]：FAI 定长头二进制成帧，带校验和与帧长预算；"]
#![doc = "- [`http`]：HTTP/1.1 客户端请求编码与响应增量解析；"]
#![doc = "- [`socks`]：SOCKS5 客户端隧道协商。"]
#![doc = ""]
#![doc = "所有过滤器都无状态、可在连接间共享，每连接的半包与协商进度保存在会话属性表中。"]

pub mod fai;
pub mod http;
pub mod socks;
