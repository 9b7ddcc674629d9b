//! 会话契约与连接状态机。
//!
//! # 设计背景（Why）
//! - 过滤器与业务处理器只应看到“能写、能关、能存取属性”的抽象会话，
//!   而不关心底层是 mio 套接字、内存桩还是 TLS 之上的隧道；
//! - 状态机独立成类型，使非法迁移在任何实现中都以同一错误码暴露。
//!
//! # 状态机（What）
//! `New → Registering → {Connecting | Accepting} → Connected → Closing → Closed`，
//! 另允许注册、连接、接受阶段的失败直接进入 `Closing`。

use std::{
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicU8, Ordering},
};

use crate::{
    attribute::AttributeMap,
    buffer::ByteBuffer,
    error::{CoreError, codes},
    future::Completion,
    message::Message,
};

/// 单次写出的完成信号：字节完全写入套接字后成功，连接关闭或编码失败时返回错误。
pub type WriteFuture = Completion<Result<(), CoreError>>;

/// 连接标识，由所属反应器分配，同时用作多路复用器注册令牌。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 连接生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    New = 0,
    Registering = 1,
    Connecting = 2,
    Accepting = 3,
    Connected = 4,
    Closing = 5,
    Closed = 6,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::New,
            1 => Self::Registering,
            2 => Self::Connecting,
            3 => Self::Accepting,
            4 => Self::Connected,
            5 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// 是否允许迁移到 `next`。
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (New, Registering)
                | (New, Closing)
                | (Registering, Connecting)
                | (Registering, Accepting)
                | (Registering, Closing)
                | (Connecting, Connected)
                | (Connecting, Closing)
                | (Accepting, Connected)
                | (Accepting, Closing)
                | (Connected, Closing)
                | (Closing, Closed)
        )
    }

    /// 尚在建立阶段，连接超时预算生效。
    pub fn is_establishing(self) -> bool {
        matches!(
            self,
            ConnectionState::Registering | ConnectionState::Connecting | ConnectionState::Accepting
        )
    }

    pub fn is_closing_or_closed(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

/// 原子状态单元，供跨线程读取、单线程写入的连接实现使用。
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// 执行一次迁移，非法迁移返回 `connection.illegal_transition` 且状态不变。
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState, CoreError> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let from = ConnectionState::from_u8(current);
            if !from.can_transition_to(next) {
                return Err(CoreError::new(
                    codes::CONNECTION_ILLEGAL_TRANSITION,
                    format!("illegal connection transition {from:?} -> {next:?}"),
                ));
            }
            match self.0.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(from),
                Err(actual) => current = actual,
            }
        }
    }
}

/// 过滤器与业务处理器看到的连接抽象。
///
/// # 契约说明（What）
/// - `write`：从链尾（业务侧）发起写出，经所有过滤器的 `on_write` 逆序编码后进入写队列，
///   同一会话上的写出严格按提交顺序落到线路；可在任意线程调用；
/// - `transmit`：链首之下的最后一跳，把已编码字节交给线路写队列；只应由过滤链调用；
/// - `close`：应用侧关闭，已排队的写出先冲刷再拆除；
/// - 关闭后的 `write` 返回以 `connection.closed` 失败的完成信号。
pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;

    fn state(&self) -> ConnectionState;

    fn attributes(&self) -> &AttributeMap;

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn write(&self, message: Message) -> WriteFuture;

    fn transmit(&self, bytes: ByteBuffer) -> Result<(), CoreError>;

    fn close(&self);

    fn is_closed(&self) -> bool {
        self.state().is_closing_or_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_follows_the_documented_edges() {
        let cell = StateCell::new(ConnectionState::New);
        for next in [
            ConnectionState::Registering,
            ConnectionState::Accepting,
            ConnectionState::Connected,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ] {
            cell.transition(next).unwrap();
        }
        assert_eq!(cell.load(), ConnectionState::Closed);
    }

    #[test]
    fn illegal_transitions_leave_state_untouched() {
        let cell = StateCell::new(ConnectionState::Registering);
        let err = cell.transition(ConnectionState::Closed).unwrap_err();
        assert_eq!(err.code(), codes::CONNECTION_ILLEGAL_TRANSITION);
        assert_eq!(cell.load(), ConnectionState::Registering);
        assert!(!ConnectionState::Closed.can_transition_to(ConnectionState::Closing));
        assert!(!ConnectionState::Connected.can_transition_to(ConnectionState::Connecting));
    }
}
