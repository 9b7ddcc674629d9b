//! 过滤器与处理器测试使用的内存桩。
//!
//! # 设计定位（Why）
//! - 编解码过滤器的行为（半包缓存、协商、逆序关闭）与套接字无关，用内存会话即可完整驱动；
//! - 各 crate 的测试共享同一组桩，接口演进时只需修改一处。
//!
//! # 使用方式（How）
//! - [`RecordingSession::attach`] 绑定过滤链后，用 [`RecordingSession::fire_connect`]、
//!   [`RecordingSession::feed`] 模拟反应器事件，用 [`RecordingSession::take_wire`] 读取写往线路的字节；
//! - [`RecordingHandler`] 记录业务回调，可选择把读到的消息原样回写。
//!
//! # 契约说明（What）
//! - `feed` 返回过滤链的错误时，会像真实连接一样先逆序通知 `on_error`，再执行关闭流程；
//! - 桩对象仅用于测试与示例，不参与生产路径。

use std::{net::SocketAddr, sync::Arc};

use parking_lot::Mutex;

use crate::{
    attribute::AttributeMap,
    buffer::ByteBuffer,
    error::CoreError,
    future::Completion,
    message::Message,
    pipeline::{ConnectionHandler, FilterChain},
    session::{ConnectionState, Session, SessionId, StateCell, WriteFuture},
};

/// 记录线路字节与关闭请求的内存会话。
#[derive(Debug)]
pub struct RecordingSession {
    id: SessionId,
    state: StateCell,
    attributes: AttributeMap,
    chain: Mutex<Option<FilterChain>>,
    wire: Mutex<Vec<u8>>,
    writes: Mutex<Vec<Message>>,
    close_requests: Mutex<usize>,
}

impl RecordingSession {
    /// 处于 `Connected` 状态的新会话。
    pub fn new(id: u64) -> Self {
        Self {
            id: SessionId(id),
            state: StateCell::new(ConnectionState::Connected),
            attributes: AttributeMap::default(),
            chain: Mutex::new(None),
            wire: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            close_requests: Mutex::new(0),
        }
    }

    /// 绑定过滤链；未绑定时 `write` 只做记录。
    pub fn attach(&self, chain: FilterChain) {
        *self.chain.lock() = Some(chain);
    }

    fn chain(&self) -> Option<FilterChain> {
        self.chain.lock().clone()
    }

    pub fn fire_connect(&self) -> Result<(), CoreError> {
        match self.chain() {
            Some(chain) => self.guard(&chain, chain.fire_connect(self)),
            None => Ok(()),
        }
    }

    /// 模拟一次套接字读。
    pub fn feed(&self, bytes: &[u8]) -> Result<(), CoreError> {
        match self.chain() {
            Some(chain) => {
                let outcome = chain.fire_read(self, Message::from(bytes));
                self.guard(&chain, outcome)
            }
            None => Ok(()),
        }
    }

    /// 模拟连接拆除：触发逆序关闭并进入 `Closed`。
    pub fn shutdown(&self) {
        if self.state.load() == ConnectionState::Closed {
            return;
        }
        let _ = self.state.transition(ConnectionState::Closing);
        if let Some(chain) = self.chain() {
            chain.fire_close(self);
        }
        let _ = self.state.transition(ConnectionState::Closed);
        self.attributes.clear();
    }

    fn guard(&self, chain: &FilterChain, outcome: Result<(), CoreError>) -> Result<(), CoreError> {
        if let Err(error) = &outcome {
            chain.fire_error(self, error);
            self.shutdown();
        }
        outcome
    }

    /// 取走所有已写往线路的字节。
    pub fn take_wire(&self) -> Vec<u8> {
        std::mem::take(&mut *self.wire.lock())
    }

    /// 取走未绑定过滤链时记录的写出消息。
    pub fn take_writes(&self) -> Vec<Message> {
        std::mem::take(&mut *self.writes.lock())
    }

    pub fn close_requests(&self) -> usize {
        *self.close_requests.lock()
    }
}

impl Session for RecordingSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn state(&self) -> ConnectionState {
        self.state.load()
    }

    fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn write(&self, message: Message) -> WriteFuture {
        if self.is_closed() {
            return Completion::completed(Err(CoreError::closed("write")));
        }
        match self.chain() {
            Some(chain) => Completion::completed(chain.fire_write(self, message)),
            None => {
                self.writes.lock().push(message);
                Completion::completed(Ok(()))
            }
        }
    }

    fn transmit(&self, bytes: ByteBuffer) -> Result<(), CoreError> {
        if self.state.load() == ConnectionState::Closed {
            return Err(CoreError::closed("transmit"));
        }
        self.wire.lock().extend_from_slice(bytes.readable()?);
        Ok(())
    }

    fn close(&self) {
        *self.close_requests.lock() += 1;
    }
}

/// 业务回调记录。
#[derive(Debug)]
pub enum HandlerEvent {
    Connect,
    Read(Message),
    Error(CoreError),
    Close,
}

/// 记录全部回调的业务处理器，克隆共享同一份记录。
#[derive(Clone, Debug, Default)]
pub struct RecordingHandler {
    events: Arc<Mutex<Vec<HandlerEvent>>>,
    echo: bool,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读到的消息原样经 `Session::write` 回写。
    pub fn echo() -> Self {
        Self {
            events: Arc::default(),
            echo: true,
        }
    }

    pub fn take_events(&self) -> Vec<HandlerEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// 取走读事件中的消息，其余事件保留。
    pub fn take_reads(&self) -> Vec<Message> {
        let mut events = self.events.lock();
        let mut reads = Vec::new();
        let mut kept = Vec::new();
        for event in events.drain(..) {
            match event {
                HandlerEvent::Read(message) => reads.push(message),
                other => kept.push(other),
            }
        }
        *events = kept;
        reads
    }

    pub fn connects(&self) -> usize {
        self.count(|event| matches!(event, HandlerEvent::Connect))
    }

    pub fn closes(&self) -> usize {
        self.count(|event| matches!(event, HandlerEvent::Close))
    }

    pub fn errors(&self) -> Vec<CoreError> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                HandlerEvent::Error(error) => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    fn count(&self, predicate: impl Fn(&HandlerEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }
}

impl ConnectionHandler for RecordingHandler {
    fn on_connect(&self, _session: &dyn Session) -> Result<(), CoreError> {
        self.events.lock().push(HandlerEvent::Connect);
        Ok(())
    }

    fn on_read(&self, session: &dyn Session, message: Message) -> Result<(), CoreError> {
        if self.echo {
            session.write(message);
        } else {
            self.events.lock().push(HandlerEvent::Read(message));
        }
        Ok(())
    }

    fn on_error(&self, _session: &dyn Session, error: &CoreError) {
        self.events.lock().push(HandlerEvent::Error(error.clone()));
    }

    fn on_close(&self, _session: &dyn Session) {
        self.events.lock().push(HandlerEvent::Close);
    }
}
