//! 单个反应器：一个线程独占一个 `mio::Poll`。
//!
//! # 执行逻辑（How）
//! 每轮迭代依次：
//! 1. 在多路复用器上阻塞，最长等到下一次清扫时刻；
//! 2. 分发就绪事件：监听令牌执行 accept，连接令牌交给对应 [`Connection`]；
//! 3. 执行其他线程投递的命令（注册、写出、关闭、任务、停止）；
//! 4. 冲刷本轮被标记为“有新字节”的连接；
//! 5. 到期时清扫超时连接。
//!
//! # 契约说明（What）
//! - 回调中的 panic 被捕获并转交连接的 `on_error`，反应器线程继续运行；
//! - 优雅停止会先执行已排队的命令并尽力冲刷写队列，中断停止直接丢弃排队命令并让其完成信号失败；
//!   两种方式最终都会拆除全部连接并触发 `on_close`。

use std::{
    collections::HashMap,
    fmt, io,
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use crossbeam_queue::SegQueue;
use fai_core::{ConnectionState, CoreError, error::panic_to_error, codes};
use mio::{Events, Interest, Poll, Registry, Token, Waker, net::TcpStream};

use crate::{
    connection::{ConnectFuture, Connection, ConnectionHandle, Progress},
    error::{self, interrupted, loop_unavailable, map_io_error},
    group::GroupShared,
    listener::ListenerEntry,
    timeout::TimeoutPolicy,
};

/// 唤醒器占用的令牌；会话令牌从 1 递增，不会与之冲突。
pub(crate) const WAKER: Token = Token(usize::MAX);

/// 投递给反应器线程的命令。
pub(crate) enum Command {
    Register(Registration),
    Listen(ListenerEntry),
    Unlisten(Token),
    /// 连接收件箱中有其他线程提交的写出待编码。
    Drain(Token),
    Close(Token),
    Execute(Box<dyn FnOnce() + Send>),
    Shutdown { interrupt: bool },
}

impl Command {
    /// 命令无法执行时，让其携带的完成信号失败并释放资源。
    pub(crate) fn reject(self, error: CoreError) {
        match self {
            Command::Register(registration) => {
                let _ = registration.handle.transition(ConnectionState::Closing);
                let _ = registration.handle.transition(ConnectionState::Closed);
                if let Some(waiter) = registration.waiter {
                    waiter.fire_done(Err(error));
                }
            }
            Command::Listen(entry) => {
                tracing::debug!(local_addr = %entry.local_addr(), "listener dropped before registration");
            }
            Command::Execute(_) => {
                tracing::debug!(code = error.code(), "loop task dropped");
            }
            // 收件箱中的写出由连接拆除时统一失败。
            Command::Drain(_) | Command::Unlisten(_) | Command::Close(_) | Command::Shutdown { .. } => {}
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Register(_) => "Register",
            Command::Listen(_) => "Listen",
            Command::Unlisten(_) => "Unlisten",
            Command::Drain(_) => "Drain",
            Command::Close(_) => "Close",
            Command::Execute(_) => "Execute",
            Command::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

/// 交给反应器注册的新连接。
pub(crate) struct Registration {
    pub handle: ConnectionHandle,
    pub stream: TcpStream,
    /// 出站连接的等待者；入站连接为 `None`。
    pub waiter: Option<ConnectFuture>,
}

/// 一次就绪事件的摘要。
#[derive(Clone, Copy, Debug)]
pub(crate) struct Readiness {
    pub token: Token,
    pub readable: bool,
}

/// 反应器与其他线程共享的部分：命令队列、脏连接队列与唤醒器。
pub(crate) struct LoopShared {
    index: usize,
    commands: SegQueue<Command>,
    dirty: SegQueue<Token>,
    waker: Waker,
    registry: Registry,
    thread: OnceLock<ThreadId>,
    running: AtomicBool,
}

impl LoopShared {
    pub fn new(index: usize, waker: Waker, registry: Registry) -> Self {
        Self {
            index,
            commands: SegQueue::new(),
            dirty: SegQueue::new(),
            waker,
            registry,
            thread: OnceLock::new(),
            running: AtomicBool::new(true),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 当前线程是否就是本反应器线程。
    pub fn is_current(&self) -> bool {
        self.thread.get() == Some(&thread::current().id())
    }

    /// 投递命令并唤醒反应器；反应器已停止时命令被拒绝。
    pub fn submit(&self, command: Command) -> Result<(), CoreError> {
        if !self.is_running() {
            let err = loop_unavailable(self.index);
            command.reject(err.clone());
            return Err(err);
        }
        self.commands.push(command);
        self.wake();
        Ok(())
    }

    /// 标记连接有新字节待写。
    pub fn mark_dirty(&self, token: Token) {
        self.dirty.push(token);
        if !self.is_current() {
            self.wake();
        }
    }

    /// 停止接收命令，并拒绝残留在队列中的命令。
    pub fn reject_pending(&self) {
        self.running.store(false, Ordering::Release);
        while let Some(command) = self.commands.pop() {
            command.reject(interrupted("command"));
        }
    }

    fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            tracing::warn!(loop_index = self.index, error = %err, "failed to wake event loop");
        }
    }
}

impl fmt::Debug for LoopShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopShared")
            .field("index", &self.index)
            .field("running", &self.is_running())
            .field("queued_commands", &self.commands.len())
            .finish()
    }
}

/// 反应器线程的私有状态。
pub(crate) struct Reactor {
    shared: Arc<LoopShared>,
    group: Arc<GroupShared>,
    poll: Poll,
    events: Events,
    connections: HashMap<Token, Connection>,
    listeners: HashMap<Token, ListenerEntry>,
    policy: TimeoutPolicy,
    read_buffer_size: usize,
    sweep_interval: Duration,
    last_sweep: Instant,
}

impl Reactor {
    pub fn new(shared: Arc<LoopShared>, group: Arc<GroupShared>, poll: Poll) -> Self {
        let config = group.context().config();
        Self {
            events: Events::with_capacity(config.events_capacity),
            policy: TimeoutPolicy::from_config(&config.timeouts),
            read_buffer_size: config.read_buffer_size,
            sweep_interval: config.sweep_interval(),
            last_sweep: Instant::now(),
            connections: HashMap::new(),
            listeners: HashMap::new(),
            shared,
            group,
            poll,
        }
    }

    pub fn run(mut self) {
        let _ = self.shared.thread.set(thread::current().id());
        let loop_index = self.shared.index;
        tracing::debug!(loop_index, "event loop started");
        loop {
            let wait = self.sweep_interval.saturating_sub(self.last_sweep.elapsed());
            if let Err(err) = self.poll.poll(&mut self.events, Some(wait)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(loop_index, error = %err, "poll failed; stopping event loop");
                self.stop(true);
                return;
            }
            let now = Instant::now();
            let ready: Vec<Readiness> = self
                .events
                .iter()
                .filter(|event| event.token() != WAKER)
                .map(|event| Readiness {
                    token: event.token(),
                    readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                })
                .collect();
            for readiness in ready {
                if self.listeners.contains_key(&readiness.token) {
                    self.accept(readiness.token);
                } else {
                    self.on_ready(readiness, now);
                }
            }
            if let Some(interrupt) = self.drain_commands(now) {
                self.stop(interrupt);
                return;
            }
            self.flush_dirty(now);
            if now.saturating_duration_since(self.last_sweep) >= self.sweep_interval {
                self.sweep(now);
                self.last_sweep = now;
            }
        }
    }

    fn on_ready(&mut self, readiness: Readiness, now: Instant) {
        let read_buffer_size = self.read_buffer_size;
        let Some(connection) = self.connections.get_mut(&readiness.token) else {
            return;
        };
        let outcome = connection.on_ready(readiness, read_buffer_size, now);
        self.settle(readiness.token, outcome);
    }

    fn settle(&mut self, token: Token, outcome: Result<Progress, CoreError>) {
        match outcome {
            Ok(Progress::Open) => {}
            Ok(Progress::Finished) => self.close(token, None),
            Err(err) => self.close(token, Some(err)),
        }
    }

    fn close(&mut self, token: Token, cause: Option<CoreError>) {
        if let Some(connection) = self.connections.remove(&token) {
            connection.teardown(self.poll.registry(), cause);
        }
    }

    fn accept(&mut self, token: Token) {
        let Some(entry) = self.listeners.get(&token) else {
            return;
        };
        loop {
            match entry.accept() {
                Ok(Some((stream, peer))) => self.adopt_inbound(token, stream, peer),
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!(
                        loop_index = self.shared.index,
                        code = err.code(),
                        error = %err,
                        "accept failed"
                    );
                    return;
                }
            }
        }
    }

    fn adopt_inbound(&self, listener: Token, stream: TcpStream, peer: SocketAddr) {
        let Some(entry) = self.listeners.get(&listener) else {
            return;
        };
        if let Err(err) = self.group.adopt(stream, peer, entry.chain().clone(), None) {
            tracing::warn!(%peer, code = err.code(), error = %err, "dropping accepted connection");
        }
    }

    fn register(&mut self, registration: Registration, now: Instant) {
        let Registration {
            handle,
            stream,
            waiter,
        } = registration;
        let token = handle.token();
        let mut connection = Connection::new(handle, stream, waiter, now);
        let next = if connection.is_outbound() {
            ConnectionState::Connecting
        } else {
            ConnectionState::Accepting
        };
        if let Err(err) = self.poll.registry().register(
            connection.stream_mut(),
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            connection.teardown(self.poll.registry(), Some(map_io_error(error::REGISTER, err)));
            return;
        }
        let entered = connection.handle().transition(next);
        self.connections.insert(token, connection);
        if entered.is_err() {
            self.close(token, None);
            return;
        }
        tracing::debug!(
            session = %token.0,
            loop_index = self.shared.index,
            state = ?next,
            "connection registered"
        );
        if next == ConnectionState::Accepting
            && let Some(connection) = self.connections.get_mut(&token)
        {
            let outcome = connection.establish(now);
            self.settle(token, outcome);
        }
    }

    fn execute(&mut self, command: Command, now: Instant) {
        match command {
            Command::Register(registration) => self.register(registration, now),
            Command::Listen(entry) => {
                let token = entry.token();
                tracing::debug!(loop_index = self.shared.index, local_addr = %entry.local_addr(), "listener attached");
                self.listeners.insert(token, entry);
                // 注册与移交之间到达的连接不会再产生边沿事件，这里主动收一次。
                self.accept(token);
            }
            Command::Unlisten(token) => {
                if let Some(mut entry) = self.listeners.remove(&token) {
                    entry.deregister(self.poll.registry());
                }
            }
            Command::Drain(token) => {
                if let Some(connection) = self.connections.get(&token) {
                    connection.handle().drain_inbox();
                }
            }
            Command::Close(token) => {
                if let Some(connection) = self.connections.get_mut(&token) {
                    connection.handle().drain_inbox();
                    let outcome = connection.flush(now);
                    self.settle(token, outcome);
                }
            }
            Command::Execute(task) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    let err = panic_to_error(codes::INTERNAL_PANIC, payload);
                    tracing::error!(loop_index = self.shared.index, error = %err, "loop task panicked");
                }
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn drain_commands(&mut self, now: Instant) -> Option<bool> {
        while let Some(command) = self.shared.commands.pop() {
            if let Command::Shutdown { interrupt } = command {
                return Some(interrupt);
            }
            self.execute(command, now);
        }
        None
    }

    fn flush_dirty(&mut self, now: Instant) {
        while let Some(token) = self.shared.dirty.pop() {
            if let Some(connection) = self.connections.get_mut(&token) {
                let outcome = connection.flush(now);
                self.settle(token, outcome);
            }
        }
    }

    fn sweep(&mut self, now: Instant) {
        let expired: Vec<(Token, CoreError)> = self
            .connections
            .iter()
            .filter_map(|(token, connection)| {
                self.policy
                    .expired(&connection.activity(), now)
                    .map(|err| (*token, err))
            })
            .collect();
        for (token, err) in expired {
            self.close(token, Some(err));
        }
    }

    /// 停止反应器并拆除全部连接与监听器。
    fn stop(mut self, interrupt: bool) {
        self.shared.running.store(false, Ordering::Release);
        let now = Instant::now();
        if interrupt {
            while let Some(command) = self.shared.commands.pop() {
                command.reject(interrupted("command"));
            }
        } else {
            while let Some(command) = self.shared.commands.pop() {
                self.execute(command, now);
            }
            self.flush_dirty(now);
        }
        for (_, mut entry) in self.listeners.drain() {
            entry.deregister(self.poll.registry());
        }
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close(token, None);
        }
        tracing::debug!(loop_index = self.shared.index, interrupt, "event loop stopped");
    }
}
