use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use fai_core::{CoreError, pipeline::FilterChain};
use mio::{
    Registry, Token,
    net::{TcpListener, TcpStream},
};

use crate::{
    error::{self, map_io_error},
    event_loop::{Command, LoopShared},
};

/// 反应器持有的监听器。
pub(crate) struct ListenerEntry {
    token: Token,
    listener: TcpListener,
    chain: FilterChain,
    local_addr: SocketAddr,
}

impl ListenerEntry {
    pub fn new(token: Token, listener: TcpListener, chain: FilterChain, local_addr: SocketAddr) -> Self {
        Self {
            token,
            listener,
            chain,
            local_addr,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 接受一个连接；积压队列为空时返回 `Ok(None)`。
    ///
    /// 对端在握手后立即复位（`ECONNABORTED`）的连接直接跳过，继续接受下一个。
    pub fn accept(&self) -> Result<Option<(TcpStream, SocketAddr)>, CoreError> {
        loop {
            match self.listener.accept() {
                Ok(accepted) => return Ok(Some(accepted)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue;
                }
                Err(err) => return Err(map_io_error(error::ACCEPT, err)),
            }
        }
    }

    pub fn deregister(&mut self, registry: &Registry) {
        if let Err(err) = registry.deregister(&mut self.listener) {
            tracing::debug!(local_addr = %self.local_addr, error = %err, "listener deregister failed");
        }
        tracing::debug!(local_addr = %self.local_addr, "listener closed");
    }
}

/// 监听句柄，由 [`EventLoopGroup::bind`](crate::EventLoopGroup::bind) 返回。
///
/// # 契约说明（What）
/// - 绑定成功即开始接受连接，新连接按轮询分配到各个事件循环，每条连接都使用绑定时给出的过滤链；
/// - [`Acceptor::close`] 停止接受新连接，已建立的连接不受影响；句柄析构时自动关闭。
#[derive(Debug)]
pub struct Acceptor {
    local_addr: SocketAddr,
    token: Token,
    event_loop: Arc<LoopShared>,
    closed: AtomicBool,
}

impl Acceptor {
    pub(crate) fn new(local_addr: SocketAddr, token: Token, event_loop: Arc<LoopShared>) -> Self {
        Self {
            local_addr,
            token,
            event_loop,
            closed: AtomicBool::new(false),
        }
    }

    /// 实际绑定的地址；绑定端口 0 时可由此取得分配的端口。
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.event_loop.submit(Command::Unlisten(self.token));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.close();
    }
}
