#![deny(unsafe_code)]
#![doc = "fai-transport-tcp: 基于 mio 的 TCP 传输层。"]
#![doc = ""]
#![doc = "- [`EventLoopGroup`]：固定数量的反应器线程，连接按轮询绑定到某个线程，此后所有回调都在该线程执行；"]
#![doc = "- [`ConnectionHandle`]：跨线程可用的会话句柄，实现 [`fai_core::Session`]；"]
#![doc = "- [`Acceptor`]：监听句柄，析构即停止接受新连接；"]
#![doc = "- [`ConnectionPool`]：按目标地址复用出站连接，区分逻辑关闭与物理关闭。"]
#![doc = ""]
#![doc = "连接、接收与发送超时由反应器按 `sweep_interval_ms` 周期清扫，超时的连接以 `timeout.*` 错误关闭。"]

mod connection;
mod error;
mod event_loop;
mod group;
mod listener;
mod pool;
mod timeout;
mod util;

pub use connection::{ConnectFuture, ConnectionHandle};
pub use group::EventLoopGroup;
pub use listener::Acceptor;
pub use pool::ConnectionPool;
