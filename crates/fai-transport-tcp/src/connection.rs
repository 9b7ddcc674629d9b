//! 连接（I/O 处理器）：把就绪事件翻译为过滤链回调。
//!
//! # 设计背景（Why）
//! - 连接的可变状态只允许所属反应器线程修改。这里拆成两半：
//!   [`Connection`] 独占套接字与活动时间戳，只存在于反应器线程的映射表里；
//!   [`ConnectionHandle`] 只含原子状态、属性表与写队列，可在任意线程克隆与调用；
//! - 非反应器线程的写出与关闭请求以命令形式投递，由反应器线程在下一轮迭代执行。
//!
//! # 契约说明（What）
//! - 任何线程的写出都先进入连接的待编码收件箱，只由反应器线程按入箱顺序取出、经过滤链编码，
//!   因此跨线程提交的写出与回调内的写出在线路上保持提交顺序；
//! - 写出的完成信号挂在它产生的最后一段字节上，这段字节完全写入套接字后才触发；
//! - 应用侧 `close` 先冲刷已排队的写出再拆除；对端 EOF 与错误立即拆除；
//! - 拆除时 `on_error`（若有原因）先于 `on_close` 触发，两者都只触发一次。

use std::{
    collections::VecDeque,
    fmt,
    io::{self, Read, Write},
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use fai_core::{
    ConnectionState, CoreError, Message, Session, SessionId, WriteFuture,
    attribute::AttributeMap,
    buffer::ByteBuffer,
    codes,
    error::panic_to_error,
    future::Completion,
    pipeline::FilterChain,
    session::StateCell,
};
use mio::{Registry, Token, net::TcpStream};
use parking_lot::Mutex;

use crate::{
    error::{self, map_io_error, peer_closed},
    event_loop::{Command, LoopShared, Readiness},
    timeout::Activity,
};

/// 出站连接的完成信号：连接建立后携带句柄成功，失败或超时返回错误。
pub type ConnectFuture = Completion<Result<ConnectionHandle, CoreError>>;

struct WireEntry {
    buffer: ByteBuffer,
    completions: Vec<WriteFuture>,
}

#[derive(Default)]
struct WireQueue {
    entries: VecDeque<WireEntry>,
    pushed: u64,
    /// 队列最近一次由空变为非空的时刻，发送超时从此刻与最近一次写出进展中较晚者起算。
    queued_at: Option<Instant>,
}

/// 尚未经过滤链编码的写出。
struct Outgoing {
    message: Message,
    completion: WriteFuture,
}

struct ConnectionShared {
    id: SessionId,
    token: Token,
    state: StateCell,
    attributes: AttributeMap,
    peer: SocketAddr,
    local: OnceLock<SocketAddr>,
    chain: FilterChain,
    inbox: Mutex<VecDeque<Outgoing>>,
    draining: AtomicBool,
    wire: Mutex<WireQueue>,
    event_loop: Arc<LoopShared>,
}

/// 连接的跨线程句柄，实现 [`Session`]。
///
/// 克隆共享同一条连接；连接拆除后句柄仍可安全调用，写出会返回 `connection.closed`。
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<ConnectionShared>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        token: Token,
        peer: SocketAddr,
        local: Option<SocketAddr>,
        chain: FilterChain,
        event_loop: Arc<LoopShared>,
    ) -> Self {
        let local_cell = OnceLock::new();
        if let Some(local) = local {
            let _ = local_cell.set(local);
        }
        Self {
            shared: Arc::new(ConnectionShared {
                id: SessionId(token.0 as u64),
                token,
                state: StateCell::new(ConnectionState::New),
                attributes: AttributeMap::default(),
                peer,
                local: local_cell,
                chain,
                inbox: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                wire: Mutex::new(WireQueue::default()),
                event_loop,
            }),
        }
    }

    pub(crate) fn token(&self) -> Token {
        self.shared.token
    }

    pub(crate) fn transition(&self, next: ConnectionState) -> Result<ConnectionState, CoreError> {
        self.shared.state.transition(next)
    }

    /// 所属事件循环的序号。
    pub fn loop_index(&self) -> usize {
        self.shared.event_loop.index()
    }

    /// 在连接所属的反应器线程上执行 `task`，与该连接的回调串行。
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> Result<(), CoreError> {
        self.shared.event_loop.submit(Command::Execute(Box::new(task)))
    }

    /// 尚未写入套接字的写出数：收件箱中待编码的消息加上写队列中的字节段。
    pub fn queued_writes(&self) -> usize {
        self.shared.inbox.lock().len() + self.shared.wire.lock().entries.len()
    }

    /// 写队列非空时返回它变为非空的时刻。
    pub(crate) fn wire_queued_at(&self) -> Option<Instant> {
        let wire = self.shared.wire.lock();
        if wire.entries.is_empty() {
            None
        } else {
            wire.queued_at
        }
    }

    /// 在反应器线程上按入箱顺序编码收件箱中的全部写出。
    ///
    /// 编码过程中回调再次写出时只入箱，由外层循环接着取出，顺序不变。
    pub(crate) fn drain_inbox(&self) {
        if self.shared.draining.swap(true, Ordering::Acquire) {
            return;
        }
        loop {
            let next = self.shared.inbox.lock().pop_front();
            let Some(Outgoing {
                message,
                completion,
            }) = next
            else {
                break;
            };
            self.write_now(message, completion);
        }
        self.shared.draining.store(false, Ordering::Release);
    }

    /// 在反应器线程上执行一次写出：经过滤链编码，并把完成信号挂到本次产生的最后一段字节上。
    fn write_now(&self, message: Message, completion: WriteFuture) {
        let before = self.shared.wire.lock().pushed;
        match guard("write", || self.shared.chain.fire_write(self, message)) {
            Ok(()) => {
                let mut wire = self.shared.wire.lock();
                if wire.pushed != before
                    && let Some(last) = wire.entries.back_mut()
                {
                    last.completions.push(completion);
                    return;
                }
                drop(wire);
                completion.fire_done(Ok(()));
            }
            Err(err) => {
                tracing::debug!(session = %self.id(), code = err.code(), "write rejected by filter chain");
                completion.fire_done(Err(err));
            }
        }
    }

    fn fail_queued_writes(&self) {
        let unencoded = std::mem::take(&mut *self.shared.inbox.lock());
        let entries = std::mem::take(&mut self.shared.wire.lock().entries);
        let completions = unencoded
            .into_iter()
            .map(|outgoing| outgoing.completion)
            .chain(entries.into_iter().flat_map(|entry| entry.completions));
        for completion in completions {
            completion.fire_done(Err(CoreError::closed("write")));
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state.load())
            .field("peer", &self.shared.peer)
            .field("loop", &self.shared.event_loop.index())
            .finish()
    }
}

impl Session for ConnectionHandle {
    fn id(&self) -> SessionId {
        self.shared.id
    }

    fn state(&self) -> ConnectionState {
        self.shared.state.load()
    }

    fn attributes(&self) -> &AttributeMap {
        &self.shared.attributes
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.shared.peer)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local.get().copied()
    }

    fn write(&self, message: Message) -> WriteFuture {
        if self.state().is_closing_or_closed() {
            return Completion::completed(Err(CoreError::closed("write")));
        }
        let completion = WriteFuture::new();
        let was_empty = {
            let mut inbox = self.shared.inbox.lock();
            let was_empty = inbox.is_empty();
            inbox.push_back(Outgoing {
                message,
                completion: completion.clone(),
            });
            was_empty
        };
        // 拆除流程先进入 `Closed` 再清空收件箱；入箱后看到 `Closed` 说明本条可能错过了清空。
        if self.state() == ConnectionState::Closed {
            self.fail_queued_writes();
            return completion;
        }
        if self.shared.event_loop.is_current() {
            self.drain_inbox();
        } else if was_empty
            && self
                .shared
                .event_loop
                .submit(Command::Drain(self.shared.token))
                .is_err()
        {
            self.fail_queued_writes();
        }
        completion
    }

    fn transmit(&self, buffer: ByteBuffer) -> Result<(), CoreError> {
        if self.state() == ConnectionState::Closed {
            return Err(CoreError::closed("transmit"));
        }
        if buffer.readable_bytes() == 0 {
            return Ok(());
        }
        let was_idle = {
            let mut wire = self.shared.wire.lock();
            let idle = wire.entries.is_empty();
            if idle {
                wire.queued_at = Some(Instant::now());
            }
            wire.entries.push_back(WireEntry {
                buffer,
                completions: Vec::new(),
            });
            wire.pushed += 1;
            idle
        };
        if was_idle {
            self.shared.event_loop.mark_dirty(self.shared.token);
        }
        Ok(())
    }

    fn close(&self) {
        if self.shared.state.transition(ConnectionState::Closing).is_ok() {
            tracing::debug!(session = %self.shared.id, "close requested");
            let _ = self
                .shared
                .event_loop
                .submit(Command::Close(self.shared.token));
        }
    }
}

/// 一次就绪处理后的连接去向。
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Progress {
    Open,
    /// 优雅关闭已完成冲刷，或关闭期间读到 EOF，可以无错误拆除。
    Finished,
}

/// 反应器线程独占的连接状态。
pub(crate) struct Connection {
    handle: ConnectionHandle,
    stream: TcpStream,
    activity: Activity,
    established: bool,
    waiter: Option<ConnectFuture>,
}

impl Connection {
    pub fn new(
        handle: ConnectionHandle,
        stream: TcpStream,
        waiter: Option<ConnectFuture>,
        now: Instant,
    ) -> Self {
        Self {
            handle,
            stream,
            activity: Activity::new(now, true),
            established: false,
            waiter,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn is_outbound(&self) -> bool {
        self.waiter.is_some()
    }

    pub fn activity(&self) -> Activity {
        let activity = Activity {
            establishing: !self.established,
            ..self.activity
        };
        match self.handle.wire_queued_at() {
            Some(queued_at) => activity.with_write_queued_at(queued_at),
            None => activity,
        }
    }

    /// 进入 `Connected`：记录本端地址，向过滤链发出 `on_connect`，再完成出站等待者。
    pub fn establish(&mut self, now: Instant) -> Result<Progress, CoreError> {
        if self.handle.transition(ConnectionState::Connected).is_err() {
            // 建立之前已被应用关闭。
            return Ok(Progress::Finished);
        }
        self.established = true;
        self.activity.last_read = now;
        self.activity.last_write_progress = now;
        if let Ok(local) = self.stream.local_addr() {
            let _ = self.handle.shared.local.set(local);
        }
        tracing::debug!(
            session = %self.handle.id(),
            peer = %self.handle.shared.peer,
            loop_index = self.handle.loop_index(),
            "connection established"
        );
        let handle = &self.handle;
        guard("connect", || handle.shared.chain.fire_connect(handle))?;
        if let Some(waiter) = self.waiter.take() {
            waiter.fire_done(Ok(self.handle.clone()));
        }
        self.flush(now)
    }

    /// 处理一次就绪事件：必要时完成连接，随后读到 `WouldBlock`，最后冲刷写队列。
    pub fn on_ready(
        &mut self,
        ready: Readiness,
        read_buffer_size: usize,
        now: Instant,
    ) -> Result<Progress, CoreError> {
        if !self.established {
            if !self.poll_connect()? {
                return Ok(Progress::Open);
            }
            if self.establish(now)? == Progress::Finished {
                return Ok(Progress::Finished);
            }
        }
        if ready.readable && self.read_ready(read_buffer_size, now)? {
            return match self.handle.state() {
                ConnectionState::Closing => Ok(Progress::Finished),
                _ => Err(peer_closed()),
            };
        }
        self.flush(now)
    }

    /// 非阻塞连接是否已完成；失败时返回连接错误。
    fn poll_connect(&mut self) -> Result<bool, CoreError> {
        if let Some(err) = self
            .stream
            .take_error()
            .map_err(|err| map_io_error(error::CONNECT, err))?
        {
            return Err(map_io_error(error::CONNECT, err));
        }
        match self.stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(err)
                if err.kind() == io::ErrorKind::NotConnected
                    || err.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(false)
            }
            Err(err) => Err(map_io_error(error::CONNECT, err)),
        }
    }

    /// 读到 `WouldBlock` 为止，每次读取的字节作为一条消息送入过滤链；返回是否读到 EOF。
    fn read_ready(&mut self, read_buffer_size: usize, now: Instant) -> Result<bool, CoreError> {
        loop {
            if self.handle.state() != ConnectionState::Connected {
                return Ok(false);
            }
            let mut buffer = ByteBuffer::allocate(read_buffer_size);
            let read = match self.stream.read(buffer.writable_mut()?) {
                Ok(0) => return Ok(true),
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(map_io_error(error::READ, err)),
            };
            buffer.commit(read)?;
            self.activity.last_read = now;
            let handle = &self.handle;
            guard("read", || {
                handle
                    .shared
                    .chain
                    .fire_read(handle, Message::Buffer(buffer))
            })?;
        }
    }

    /// 把写队列尽量写入套接字；优雅关闭中且队列清空时返回 [`Progress::Finished`]。
    pub fn flush(&mut self, now: Instant) -> Result<Progress, CoreError> {
        let closing = self.handle.state() == ConnectionState::Closing;
        if !self.established {
            return Ok(if closing {
                Progress::Finished
            } else {
                Progress::Open
            });
        }
        let mut flushed = Vec::new();
        let (outcome, drained) = {
            let mut wire = self.handle.shared.wire.lock();
            let outcome = drain_wire(
                &mut self.stream,
                &mut wire,
                &mut flushed,
                &mut self.activity.last_write_progress,
                now,
            );
            (outcome, wire.entries.is_empty())
        };
        for completion in flushed {
            completion.fire_done(Ok(()));
        }
        outcome?;
        Ok(if closing && drained {
            Progress::Finished
        } else {
            Progress::Open
        })
    }

    /// 拆除连接：`on_error`（若有原因）→ 注销并释放套接字 → `Closed` → 失败未完成的写出 → `on_close`。
    pub fn teardown(self, registry: &Registry, cause: Option<CoreError>) {
        let Connection {
            handle,
            mut stream,
            waiter,
            ..
        } = self;
        let _ = handle.transition(ConnectionState::Closing);
        if let Some(cause) = &cause {
            if cause.is_timeout() {
                tracing::warn!(session = %handle.id(), code = cause.code(), "connection timed out");
            } else {
                tracing::debug!(session = %handle.id(), code = cause.code(), error = %cause, "closing on error");
            }
            let _ = guard("error", || {
                handle.shared.chain.fire_error(&handle, cause);
                Ok(())
            });
        }
        if let Err(err) = registry.deregister(&mut stream) {
            tracing::debug!(session = %handle.id(), error = %err, "deregister failed");
        }
        drop(stream);
        let _ = handle.transition(ConnectionState::Closed);
        handle.fail_queued_writes();
        if let Some(waiter) = waiter {
            waiter.fire_done(Err(
                cause.unwrap_or_else(|| CoreError::closed("connect"))
            ));
        }
        let _ = guard("close", || {
            handle.shared.chain.fire_close(&handle);
            Ok(())
        });
        handle.shared.attributes.clear();
        tracing::debug!(session = %handle.id(), "connection closed");
    }
}

fn drain_wire(
    stream: &mut TcpStream,
    wire: &mut WireQueue,
    flushed: &mut Vec<WriteFuture>,
    progress: &mut Instant,
    now: Instant,
) -> Result<(), CoreError> {
    while let Some(entry) = wire.entries.front_mut() {
        let written = match stream.write(entry.buffer.readable()?) {
            Ok(0) => {
                return Err(map_io_error(
                    error::WRITE,
                    io::Error::from(io::ErrorKind::WriteZero),
                ));
            }
            Ok(written) => written,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(map_io_error(error::WRITE, err)),
        };
        *progress = now;
        entry.buffer.advance(written)?;
        if entry.buffer.readable_bytes() == 0
            && let Some(done) = wire.entries.pop_front()
        {
            flushed.extend(done.completions);
        }
    }
    Ok(())
}

/// 在捕获 panic 的前提下执行回调；panic 转为 `internal.callback_panicked` 错误。
pub(crate) fn guard<T>(
    stage: &'static str,
    callback: impl FnOnce() -> Result<T, CoreError>,
) -> Result<T, CoreError> {
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let err = panic_to_error(codes::INTERNAL_PANIC, payload);
            tracing::error!(stage, error = %err, "callback panicked; loop continues");
            Err(err)
        }
    }
}
