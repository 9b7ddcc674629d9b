use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
};

use fai_core::{
    ConnectionState, CoreError, codes, context::EngineContext, future::Completion,
    pipeline::FilterChain,
};
use mio::{Interest, Poll, Token, Waker, net::TcpStream};
use parking_lot::Mutex;

use crate::{
    connection::{ConnectFuture, ConnectionHandle},
    error::{self, map_io_error},
    event_loop::{Command, LoopShared, Reactor, Registration, WAKER},
    listener::{Acceptor, ListenerEntry},
    util,
};

/// 事件循环组内各线程共享的只读视图。
#[derive(Debug)]
pub(crate) struct GroupShared {
    loops: Box<[Arc<LoopShared>]>,
    next_loop: AtomicUsize,
    next_token: AtomicUsize,
    context: EngineContext,
}

impl GroupShared {
    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    /// 轮询选择下一个事件循环；连接一经分配终身不迁移。
    fn next_loop(&self) -> &Arc<LoopShared> {
        let index = self.next_loop.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        &self.loops[index]
    }

    fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// 为新套接字创建连接句柄并移交给选中的事件循环。
    pub fn adopt(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        chain: FilterChain,
        waiter: Option<ConnectFuture>,
    ) -> Result<ConnectionHandle, CoreError> {
        util::configure_stream(&stream, self.context.config())?;
        let event_loop = self.next_loop();
        let handle = ConnectionHandle::new(
            self.next_token(),
            peer,
            stream.local_addr().ok(),
            chain,
            Arc::clone(event_loop),
        );
        handle.transition(ConnectionState::Registering)?;
        event_loop.submit(Command::Register(Registration {
            handle: handle.clone(),
            stream,
            waiter,
        }))?;
        Ok(handle)
    }
}

/// 固定大小的反应器线程组。
///
/// # 设计背景（Why）
/// - 每个线程独占一个多路复用器，连接注册时按轮询绑定到某个线程，此后所有回调都在该线程执行，
///   连接状态因此只有一个写者；
/// - 组对象由宿主显式创建并持有 [`EngineContext`]，析构时自动停止，不依赖进程级单例。
///
/// # 契约说明（What）
/// - [`EventLoopGroup::bind`]：同步绑定监听地址，失败立即返回 `transport.bind_failed`；
/// - [`EventLoopGroup::connect`]：发起非阻塞连接，返回的完成信号在连接建立、失败或连接超时时触发；
/// - [`EventLoopGroup::execute`]：在某个反应器线程上执行任务；
/// - [`EventLoopGroup::shutdown`]：`interrupt = false` 时执行完已排队的命令、尽力冲刷写队列再拆除连接；
///   `interrupt = true` 时丢弃排队命令。两种方式都会等待全部线程退出，可重复调用。
///
/// # 风险提示（Trade-offs）
/// - 在反应器线程内调用 `shutdown` 无法等待自身退出，此时只发出停止命令并立即返回。
///
/// ```rust,no_run
/// use fai_core::{config::EngineConfig, context::EngineContext, pipeline::FilterChain, test_stubs::RecordingHandler};
/// use fai_transport_tcp::EventLoopGroup;
///
/// let context = EngineContext::new(EngineConfig::default()).unwrap();
/// let group = EventLoopGroup::new(context).unwrap();
/// let chain = FilterChain::builder(RecordingHandler::echo()).build();
/// let acceptor = group.bind("127.0.0.1:0".parse().unwrap(), chain).unwrap();
/// println!("listening on {}", acceptor.local_addr());
/// group.shutdown(false);
/// ```
#[derive(Debug)]
pub struct EventLoopGroup {
    shared: Arc<GroupShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl EventLoopGroup {
    /// 按 `context` 中的 `event_loops` 启动反应器线程。
    pub fn new(context: EngineContext) -> Result<Self, CoreError> {
        let count = context.config().event_loops;
        let mut polls = Vec::with_capacity(count);
        let mut loops = Vec::with_capacity(count);
        for index in 0..count {
            let poll = Poll::new().map_err(|err| map_io_error(error::REGISTER, err))?;
            let waker =
                Waker::new(poll.registry(), WAKER).map_err(|err| map_io_error(error::REGISTER, err))?;
            let registry = poll
                .registry()
                .try_clone()
                .map_err(|err| map_io_error(error::REGISTER, err))?;
            loops.push(Arc::new(LoopShared::new(index, waker, registry)));
            polls.push(poll);
        }
        let shared = Arc::new(GroupShared {
            loops: loops.into_boxed_slice(),
            next_loop: AtomicUsize::new(0),
            next_token: AtomicUsize::new(1),
            context,
        });
        let group = Self {
            shared: Arc::clone(&shared),
            threads: Mutex::new(Vec::with_capacity(count)),
            stopped: AtomicBool::new(false),
        };
        for (index, poll) in polls.into_iter().enumerate() {
            let reactor = Reactor::new(Arc::clone(&shared.loops[index]), Arc::clone(&shared), poll);
            let spawned = thread::Builder::new()
                .name(format!("fai-loop-{index}"))
                .spawn(move || reactor.run());
            match spawned {
                Ok(handle) => group.threads.lock().push(handle),
                Err(err) => {
                    // 已启动的线程由 `group` 析构时停止。
                    return Err(CoreError::new(
                        codes::INTERNAL_SPAWN,
                        format!("failed to spawn event loop {index}: {err}"),
                    ));
                }
            }
        }
        tracing::info!(event_loops = count, "event loop group started");
        Ok(group)
    }

    pub fn context(&self) -> &EngineContext {
        &self.shared.context
    }

    /// 事件循环数量。
    pub fn loops(&self) -> usize {
        self.shared.loops.len()
    }

    fn ensure_running(&self) -> Result<(), CoreError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(CoreError::new(
                codes::INTERNAL_SHUTDOWN,
                "event loop group has been shut down",
            ));
        }
        Ok(())
    }

    /// 绑定监听地址，新连接使用 `chain` 处理。
    pub fn bind(&self, addr: SocketAddr, chain: FilterChain) -> Result<Acceptor, CoreError> {
        self.ensure_running()?;
        let mut listener = util::bind_listener(addr)?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, err))?;
        let event_loop = self.shared.next_loop();
        let token = self.shared.next_token();
        event_loop
            .registry()
            .register(&mut listener, token, Interest::READABLE)
            .map_err(|err| map_io_error(error::REGISTER, err))?;
        event_loop.submit(Command::Listen(ListenerEntry::new(
            token, listener, chain, local_addr,
        )))?;
        tracing::info!(%local_addr, loop_index = event_loop.index(), "listening");
        Ok(Acceptor::new(local_addr, token, Arc::clone(event_loop)))
    }

    /// 发起到 `addr` 的出站连接。
    pub fn connect(&self, addr: SocketAddr, chain: FilterChain) -> ConnectFuture {
        let waiter = ConnectFuture::new();
        let outcome = self.ensure_running().and_then(|()| {
            let stream =
                TcpStream::connect(addr).map_err(|err| map_io_error(error::CONNECT, err))?;
            self.shared
                .adopt(stream, addr, chain, Some(waiter.clone()))
        });
        if let Err(err) = outcome {
            tracing::debug!(peer = %addr, code = err.code(), "connect failed before registration");
            waiter.fire_done(Err(err));
        }
        waiter
    }

    /// 在轮询选中的反应器线程上执行 `task`；任务中的 panic 被捕获并记录。
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> Result<(), CoreError> {
        self.ensure_running()?;
        self.shared.next_loop().submit(Command::Execute(Box::new(task)))
    }

    /// 在所有反应器线程上各执行一次 `task`，返回全部执行完毕的信号。
    pub fn broadcast(&self, task: impl Fn(usize) + Send + Sync + 'static) -> Completion<()> {
        let done = Completion::new();
        if self.ensure_running().is_err() {
            done.fire_done(());
            return done;
        }
        let task = Arc::new(task);
        let remaining = Arc::new(AtomicUsize::new(self.loops()));
        for event_loop in self.shared.loops.iter() {
            let task = Arc::clone(&task);
            let remaining = Arc::clone(&remaining);
            let finished = done.clone();
            let index = event_loop.index();
            let finish = move || {
                task(index);
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    finished.fire_done(());
                }
            };
            if event_loop.submit(Command::Execute(Box::new(finish))).is_err() {
                done.fire_done(());
            }
        }
        done
    }

    /// 停止全部事件循环。
    pub fn shutdown(&self, interrupt: bool) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for event_loop in self.shared.loops.iter() {
            let _ = event_loop.submit(Command::Shutdown { interrupt });
        }
        if self.shared.loops.iter().any(|event_loop| event_loop.is_current()) {
            tracing::warn!("shutdown requested from an event loop thread; not waiting for loops to exit");
            return;
        }
        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                tracing::error!("event loop thread panicked during shutdown");
            }
        }
        for event_loop in self.shared.loops.iter() {
            event_loop.reject_pending();
        }
        tracing::info!(interrupt, "event loop group stopped");
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}
