use std::{io, net::SocketAddr};

use fai_core::{CoreError, config::EngineConfig};
use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::error::{self, map_io_error};

/// 监听队列长度。
const BACKLOG: i32 = 1024;

/// 按配置为已建立或正在建立的连接设置 `TCP_NODELAY` 与 `SO_KEEPALIVE`。
pub(crate) fn configure_stream(stream: &TcpStream, config: &EngineConfig) -> Result<(), CoreError> {
    stream
        .set_nodelay(config.tcp_nodelay)
        .map_err(|err| map_io_error(error::CONFIGURE, err))?;
    SockRef::from(stream)
        .set_keepalive(config.tcp_keepalive)
        .map_err(|err| map_io_error(error::CONFIGURE, err))
}

/// 创建非阻塞监听套接字。
///
/// # 执行逻辑（How）
/// - 经 `socket2` 构造套接字并开启 `SO_REUSEADDR`，测试与重启场景下端口可立即复用；
/// - 绑定、监听后转为非阻塞，再交给 mio 管理。
pub(crate) fn bind_listener(addr: SocketAddr) -> Result<TcpListener, CoreError> {
    let socket = open_listener(addr).map_err(|err| map_io_error(error::BIND, err))?;
    Ok(TcpListener::from_std(socket.into()))
}

fn open_listener(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}
