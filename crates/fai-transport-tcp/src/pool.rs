//! 按目标地址复用出站连接。
//!
//! # 设计背景（Why）
//! - 连接池区分两种关闭：**逻辑关闭**（[`ConnectionPool::release`]）把仍然存活的连接还回池中待复用，
//!   套接字保持打开；**物理关闭**（[`ConnectionPool::close`]）拆除套接字。两者是不同的显式操作，
//!   不从连接状态推断；
//! - 归还可能发生在任意线程，空闲连接经无锁队列移交，不直接修改连接字段。
//!
//! # 契约说明（What）
//! - `acquire` 优先取出同一地址下仍处于 `Connected` 的空闲连接，已被对端或清扫关闭的条目被跳过；
//!   没有可用连接时新建；
//! - 每个地址最多保留 `max_idle_per_addr` 条空闲连接，超出的归还直接物理关闭；
//! - 空闲连接仍受接收超时约束，空闲过久会被反应器清扫关闭，下一次 `acquire` 时自然跳过。

use std::{net::SocketAddr, sync::Arc};

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use fai_core::{ConnectionState, Session, future::Completion, pipeline::FilterChain};

use crate::{
    connection::{ConnectFuture, ConnectionHandle},
    group::EventLoopGroup,
};

type IdleQueue = Arc<SegQueue<ConnectionHandle>>;

/// 出站连接池。
#[derive(Debug)]
pub struct ConnectionPool {
    group: Arc<EventLoopGroup>,
    chain: FilterChain,
    max_idle_per_addr: usize,
    idle: DashMap<SocketAddr, IdleQueue>,
}

impl ConnectionPool {
    /// 新建连接池；新连接都使用 `chain`。
    pub fn new(group: Arc<EventLoopGroup>, chain: FilterChain, max_idle_per_addr: usize) -> Self {
        Self {
            group,
            chain,
            max_idle_per_addr,
            idle: DashMap::new(),
        }
    }

    /// 取得一条到 `addr` 的连接。
    pub fn acquire(&self, addr: SocketAddr) -> ConnectFuture {
        if let Some(handle) = self.take_idle(addr) {
            tracing::debug!(session = %handle.id(), peer = %addr, "reusing pooled connection");
            return Completion::completed(Ok(handle));
        }
        self.group.connect(addr, self.chain.clone())
    }

    fn take_idle(&self, addr: SocketAddr) -> Option<ConnectionHandle> {
        // 先克隆队列再出队，避免持有分片锁时做其他操作。
        let queue = self.idle.get(&addr).map(|entry| Arc::clone(entry.value()))?;
        while let Some(handle) = queue.pop() {
            if handle.state() == ConnectionState::Connected {
                return Some(handle);
            }
            tracing::trace!(session = %handle.id(), "skipping closed idle connection");
        }
        None
    }

    /// 逻辑关闭：把连接还回池中。已关闭的连接被丢弃，超出空闲上限的连接被物理关闭。
    pub fn release(&self, handle: ConnectionHandle) {
        if handle.state() != ConnectionState::Connected {
            return;
        }
        let Some(peer) = handle.peer_addr() else {
            handle.close();
            return;
        };
        let queue = Arc::clone(self.idle.entry(peer).or_default().value());
        if queue.len() >= self.max_idle_per_addr {
            tracing::debug!(session = %handle.id(), %peer, "idle limit reached; closing connection");
            handle.close();
            return;
        }
        queue.push(handle);
    }

    /// 物理关闭：冲刷已排队的写出后拆除套接字，连接不再回到池中。
    pub fn close(&self, handle: &ConnectionHandle) {
        handle.close();
    }

    /// `addr` 下排队的空闲连接数（可能包含尚未被跳过的已关闭条目）。
    pub fn idle_count(&self, addr: SocketAddr) -> usize {
        self.idle.get(&addr).map_or(0, |entry| entry.value().len())
    }

    /// 物理关闭全部空闲连接。
    pub fn clear(&self) {
        for entry in self.idle.iter() {
            while let Some(handle) = entry.value().pop() {
                handle.close();
            }
        }
    }
}
