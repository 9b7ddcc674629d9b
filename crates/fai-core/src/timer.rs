//! 定时执行器：单线程 + 截止时间小根堆。
//!
//! # 设计背景（Why）
//! - `Stream::sleep` 需要“到点再继续”，但不能占用反应器或调用方线程；
//! - 引擎中定时需求量小、精度要求为毫秒级，一条专用线程足够。
//!
//! # 执行逻辑（How）
//! - 任务按 `(deadline, seq)` 入堆，`seq` 保证同一截止时间下按提交顺序触发；
//! - 线程在 `Condvar` 上等到堆顶截止时间或被新任务唤醒；
//! - 任务体在 `catch_unwind` 中执行，panic 以 `error` 级别记录，线程继续服务。
//!
//! # 契约说明（What）
//! - [`TimerHandle::cancel`] 在任务开始执行前调用才有效；
//! - [`Timer::shutdown`] 丢弃未触发任务并回收线程，之后提交的任务被静默忽略。

use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::error::{CoreError, codes, panic_to_error};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // 反转比较，让 BinaryHeap 表现为小根堆。
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// 可克隆的定时器句柄，所有克隆共享同一线程。
#[derive(Clone)]
pub struct Timer {
    shared: Arc<Shared>,
}

/// 已调度任务的取消句柄。
#[derive(Clone, Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Timer {
    /// 启动定时线程。
    pub fn start(name: &str) -> Result<Self, CoreError> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wakeup: Condvar::new(),
            worker: Mutex::new(None),
        });
        let runner = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run(&runner))
            .map_err(|err| CoreError::from_io(codes::INTERNAL_SPAWN, "spawn timer thread", err))?;
        *shared.worker.lock() = Some(handle);
        Ok(Self { shared })
    }

    /// 在 `delay` 之后执行 `task`。
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = TimerHandle {
            cancelled: Arc::clone(&cancelled),
        };
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            tracing::debug!("timer already shut down; task dropped");
            handle.cancel();
            return handle;
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Entry {
            deadline: Instant::now() + delay,
            seq,
            cancelled,
            task: Box::new(task),
        });
        drop(queue);
        self.shared.wakeup.notify_one();
        handle
    }

    /// 尚未触发的任务数。
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }

    /// 停止线程并丢弃未触发任务；可重复调用。
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            queue.heap.clear();
        }
        self.shared.wakeup.notify_all();
        let worker = self.shared.worker.lock().take();
        if let Some(worker) = worker
            && worker.thread().id() != thread::current().id()
            && worker.join().is_err()
        {
            tracing::error!("timer thread terminated abnormally");
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("pending", &self.pending())
            .finish()
    }
}

fn run(shared: &Shared) {
    loop {
        let entry = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.shutdown {
                    return;
                }
                let now = Instant::now();
                match queue.heap.peek().map(|entry| entry.deadline) {
                    Some(deadline) if deadline <= now => break queue.heap.pop(),
                    Some(deadline) => {
                        shared.wakeup.wait_until(&mut queue, deadline);
                    }
                    None => shared.wakeup.wait(&mut queue),
                }
            }
        };
        let Some(entry) = entry else { continue };
        if entry.cancelled.load(Ordering::Acquire) {
            continue;
        }
        if let Err(payload) = catch_unwind(AssertUnwindSafe(entry.task)) {
            let err = panic_to_error(codes::INTERNAL_TASK_PANICKED, payload);
            tracing::error!(code = err.code(), error = %err, "timer task panicked");
        }
    }
}
