//! 环回集成测试：真实套接字上的成帧回显、写出顺序、超时清扫、panic 隔离与停止语义。

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use fai_codecs::fai::{FaiCodec, FaiFrame, FaiFrameFilter};
use fai_core::{
    CoreError, Message, Session, codes,
    buffer::ByteBuffer,
    config::{EngineConfig, TimeoutConfig},
    context::EngineContext,
    pipeline::{ConnectionHandler, FilterChain},
    test_stubs::RecordingHandler,
};
use fai_transport_tcp::{ConnectionHandle, EventLoopGroup};

const PATIENCE: Duration = Duration::from_secs(5);

fn group_with(timeouts: TimeoutConfig) -> EventLoopGroup {
    let config = EngineConfig {
        event_loops: 2,
        sweep_interval_ms: 50,
        timeouts,
        ..EngineConfig::default()
    };
    EventLoopGroup::new(EngineContext::new(config).expect("context")).expect("group")
}

fn group() -> EventLoopGroup {
    group_with(TimeoutConfig::disabled())
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().expect("addr")
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

fn client(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("client connect");
    stream.set_read_timeout(Some(PATIENCE)).expect("read timeout");
    stream
}

fn read_to_eof(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    stream.read_to_end(&mut received).expect("read until eof");
    received
}

/// 读到 `b"boom"` 时 panic，其余回调交给内部的记录处理器。
#[derive(Clone)]
struct Exploding(RecordingHandler);

impl ConnectionHandler for Exploding {
    fn on_connect(&self, session: &dyn Session) -> Result<(), CoreError> {
        self.0.on_connect(session)
    }

    fn on_read(&self, session: &dyn Session, message: Message) -> Result<(), CoreError> {
        let bytes = message.into_buffer()?.to_vec()?;
        if bytes == b"boom" {
            panic!("handler exploded");
        }
        self.0.on_read(session, Message::Buffer(ByteBuffer::wrap(bytes)))
    }

    fn on_error(&self, session: &dyn Session, error: &CoreError) {
        self.0.on_error(session, error)
    }

    fn on_close(&self, session: &dyn Session) {
        self.0.on_close(session)
    }
}

/// 连接建立后写出一大块数据并立即请求关闭。
struct BlastAndClose {
    size: usize,
}

impl ConnectionHandler for BlastAndClose {
    fn on_connect(&self, session: &dyn Session) -> Result<(), CoreError> {
        session.write(Message::Buffer(ByteBuffer::wrap(vec![0x5a; self.size])));
        session.close();
        Ok(())
    }

    fn on_read(&self, _session: &dyn Session, _message: Message) -> Result<(), CoreError> {
        Ok(())
    }
}

/// 收到数据时先由另一线程经句柄写出 `w1` 并等待其提交完成，再在回调内写出 `w2`。
struct ForeignThenInline {
    handle: Arc<OnceLock<ConnectionHandle>>,
}

impl ConnectionHandler for ForeignThenInline {
    fn on_read(&self, session: &dyn Session, _message: Message) -> Result<(), CoreError> {
        if let Some(handle) = self.handle.get().cloned() {
            thread::spawn(move || {
                handle.write(Message::from("w1"));
            })
            .join()
            .map_err(|_| CoreError::new(codes::INTERNAL_PANIC, "foreign writer panicked"))?;
        }
        session.write(Message::from("w2"));
        Ok(())
    }
}

#[test]
fn fai_frame_split_across_segments_is_echoed_once() {
    let group = group();
    let handler = RecordingHandler::echo();
    let chain = FilterChain::builder(handler.clone())
        .add_last(FaiFrameFilter::new(64 * 1024))
        .build();
    let acceptor = group.bind(loopback(), chain).expect("bind");

    let codec = FaiCodec::new(64 * 1024);
    let frame = FaiFrame::request(7, 0x0101, 42, b"8 bytes!".to_vec());
    let wire = codec.encode_to_bytes(&frame).expect("encode");
    assert_eq!(wire.len(), 40);

    let mut stream = client(acceptor.local_addr());
    for segment in [&wire[..10], &wire[10..25], &wire[25..]] {
        stream.write_all(segment).expect("write segment");
        stream.flush().expect("flush");
        thread::sleep(Duration::from_millis(20));
    }
    let mut echoed = vec![0u8; wire.len()];
    stream.read_exact(&mut echoed).expect("echo");
    assert_eq!(echoed, wire.to_vec());

    let mut pending = BytesMut::from(&echoed[..]);
    let decoded = codec.decode(&mut pending).expect("decode").expect("complete frame");
    assert_eq!(decoded, frame);
    assert_eq!(handler.connects(), 1);
    assert!(handler.errors().is_empty());
}

#[test]
fn writes_from_another_thread_keep_their_order() {
    let server = TcpListener::bind(loopback()).expect("raw server");
    let addr = server.local_addr().expect("server addr");
    let expected: Vec<u8> = (0..200).flat_map(|i| format!("{i:04};").into_bytes()).collect();
    let expected_len = expected.len();
    let reader = thread::spawn(move || {
        let (mut stream, _) = server.accept().expect("accept");
        stream.set_read_timeout(Some(PATIENCE)).expect("read timeout");
        let mut received = vec![0u8; expected_len];
        stream.read_exact(&mut received).expect("read all writes");
        received
    });

    let group = group();
    let handle = group
        .connect(addr, FilterChain::builder(RecordingHandler::new()).build())
        .wait_timeout(PATIENCE)
        .expect("connect completes")
        .expect("connected");

    let writer = {
        let handle = handle.clone();
        thread::spawn(move || {
            let mut last = None;
            for i in 0..200 {
                let chunk = ByteBuffer::copy_from_slice(format!("{i:04};").as_bytes());
                last = Some(handle.write(Message::Buffer(chunk)));
            }
            last
        })
    };
    let last = writer.join().expect("writer thread").expect("at least one write");
    assert!(matches!(last.wait_timeout(PATIENCE), Some(Ok(()))));
    assert_eq!(reader.join().expect("reader thread"), expected);
    assert_eq!(handle.queued_writes(), 0);
}

#[test]
fn foreign_thread_write_stays_ahead_of_a_later_callback_write() {
    let server = TcpListener::bind(loopback()).expect("raw server");
    let addr = server.local_addr().expect("server addr");
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let peer = thread::spawn(move || {
        let (mut stream, _) = server.accept().expect("accept");
        stream.set_read_timeout(Some(PATIENCE)).expect("read timeout");
        go_rx.recv_timeout(PATIENCE).expect("handle published");
        stream.write_all(b"go").expect("trigger");
        let mut received = [0u8; 4];
        stream.read_exact(&mut received).expect("both writes");
        received
    });

    let slot = Arc::new(OnceLock::new());
    let group = group();
    let handle = group
        .connect(
            addr,
            FilterChain::builder(ForeignThenInline {
                handle: Arc::clone(&slot),
            })
            .build(),
        )
        .wait_timeout(PATIENCE)
        .expect("connect completes")
        .expect("connected");
    assert!(slot.set(handle).is_ok());
    go_tx.send(()).expect("peer waiting");

    assert_eq!(&peer.join().expect("peer thread"), b"w1w2");
}

#[test]
fn idle_connection_is_closed_by_the_recv_timeout() {
    let group = group_with(TimeoutConfig {
        connect_ms: 0,
        recv_ms: 200,
        send_ms: 0,
    });
    let handler = RecordingHandler::new();
    let acceptor = group
        .bind(loopback(), FilterChain::builder(handler.clone()).build())
        .expect("bind");

    let started = Instant::now();
    let mut stream = client(acceptor.local_addr());
    wait_until("recv timeout closure", || handler.closes() == 1);
    assert!(started.elapsed() >= Duration::from_millis(200));

    let errors = handler.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code(), codes::TIMEOUT_RECV);
    assert!(errors[0].is_timeout());
    assert!(read_to_eof(&mut stream).is_empty());
}

#[test]
fn refused_connect_fails_the_future() {
    let vacant = TcpListener::bind(loopback()).expect("probe");
    let addr = vacant.local_addr().expect("probe addr");
    drop(vacant);

    let group = group();
    let outcome = group
        .connect(addr, FilterChain::builder(RecordingHandler::new()).build())
        .wait_timeout(PATIENCE)
        .expect("connect completes");
    let err = outcome.expect_err("nobody is listening");
    assert_eq!(err.code(), codes::TRANSPORT_CONNECT);
}

#[test]
fn handler_panic_closes_only_the_offending_connection() {
    let group = group_with(TimeoutConfig::disabled());
    let recorder = RecordingHandler::echo();
    let acceptor = group
        .bind(loopback(), FilterChain::builder(Exploding(recorder.clone())).build())
        .expect("bind");

    let mut offender = client(acceptor.local_addr());
    offender.write_all(b"boom").expect("send boom");
    assert!(read_to_eof(&mut offender).is_empty());
    wait_until("panic reported", || !recorder.errors().is_empty());
    assert_eq!(recorder.errors()[0].code(), codes::INTERNAL_PANIC);
    wait_until("offender closed", || recorder.closes() == 1);

    let mut survivor = client(acceptor.local_addr());
    survivor.write_all(b"ping").expect("send ping");
    let mut echoed = [0u8; 4];
    survivor.read_exact(&mut echoed).expect("echo after panic");
    assert_eq!(&echoed, b"ping");
}

#[test]
fn application_close_flushes_queued_bytes_first() {
    const SIZE: usize = 4 * 1024 * 1024;
    let group = group();
    let acceptor = group
        .bind(loopback(), FilterChain::builder(BlastAndClose { size: SIZE }).build())
        .expect("bind");

    let mut stream = client(acceptor.local_addr());
    let received = read_to_eof(&mut stream);
    assert_eq!(received.len(), SIZE);
    assert!(received.iter().all(|byte| *byte == 0x5a));
}

#[test]
fn shutdown_closes_connections_and_rejects_new_work() {
    let group = group();
    let handler = RecordingHandler::new();
    let acceptor = group
        .bind(loopback(), FilterChain::builder(handler.clone()).build())
        .expect("bind");
    let addr = acceptor.local_addr();

    let mut stream = client(addr);
    wait_until("server side established", || handler.connects() == 1);

    group.shutdown(false);
    assert_eq!(handler.closes(), 1);
    assert!(handler.errors().is_empty());
    assert!(read_to_eof(&mut stream).is_empty());

    let err = group
        .connect(addr, FilterChain::builder(RecordingHandler::new()).build())
        .wait_timeout(PATIENCE)
        .expect("rejected immediately")
        .expect_err("group is stopped");
    assert_eq!(err.code(), codes::INTERNAL_SHUTDOWN);
    let err = group
        .bind(loopback(), FilterChain::builder(RecordingHandler::new()).build())
        .expect_err("group is stopped");
    assert_eq!(err.code(), codes::INTERNAL_SHUTDOWN);
    assert!(group.execute(|| {}).is_err());

    // 重复停止无副作用。
    group.shutdown(true);
}

#[test]
fn tasks_run_on_loop_threads() {
    let group = group();
    let (tx, rx) = mpsc::channel();
    group
        .execute(move || {
            let name = thread::current().name().map(str::to_owned);
            let _ = tx.send(name);
        })
        .expect("execute");
    let name = rx.recv_timeout(PATIENCE).expect("task ran").expect("named thread");
    assert!(name.starts_with("fai-loop-"), "unexpected thread {name}");

    let visited = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&visited);
    let done = group.broadcast(move |_index| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(done.wait_timeout(PATIENCE), Some(()));
    assert_eq!(visited.load(Ordering::SeqCst), group.loops());
}

#[test]
fn handle_reports_addresses_and_rejects_writes_after_close() {
    let group = group();
    let acceptor = group
        .bind(loopback(), FilterChain::builder(RecordingHandler::echo()).build())
        .expect("bind");
    let handler = RecordingHandler::new();
    let handle = group
        .connect(acceptor.local_addr(), FilterChain::builder(handler.clone()).build())
        .wait_timeout(PATIENCE)
        .expect("connect completes")
        .expect("connected");
    assert_eq!(handle.peer_addr(), Some(acceptor.local_addr()));
    assert!(handle.local_addr().is_some());
    assert!(handle.loop_index() < group.loops());
    assert_eq!(handler.connects(), 1);

    let echoed = handle.write(Message::Buffer(ByteBuffer::copy_from_slice(b"hi")));
    assert!(matches!(echoed.wait_timeout(PATIENCE), Some(Ok(()))));
    wait_until("echo received", || !handler.take_reads().is_empty());

    handle.close();
    wait_until("closed", || handle.is_closed());
    assert_eq!(handler.closes(), 1);
    let late = handle.write(Message::Buffer(ByteBuffer::copy_from_slice(b"late")));
    let err = late
        .wait_timeout(PATIENCE)
        .expect("rejected immediately")
        .expect_err("closed connection");
    assert_eq!(err.code(), codes::CONNECTION_CLOSED);
}
