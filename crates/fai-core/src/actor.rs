//! 按键串行的任务执行器（Actor 锁）。
//!
//! # 设计背景（Why）
//! - 某些资源（同一账户、同一上游连接）需要互斥访问，但工作线程不应阻塞在操作系统锁上等待；
//! - 用“每键一条等待队列 + 当前持有者编号”表达互斥：拿不到键的任务被挂起到该键的队列，
//!   工作线程立即去执行其他键的任务。
//!
//! # 执行逻辑（How）
//! 1. [`ActorSerializer::lock`] 为任务分配编号，调用 `acquire`：
//!    键空闲则登记为当前持有者并推入全局队列；键被占用则追加到该键的等待队列；
//! 2. 工作线程从全局无锁队列（`crossbeam_queue::SegQueue`）取任务执行；
//! 3. 任务结束调用 `release`：等待队列为空则删除该键；否则取出下一个任务，登记为持有者后重新提交，
//!    重新提交时 `acquire` 识别出“自己就是当前持有者”而直接放行。
//!
//! # 契约说明（What）
//! - 同一键的任务严格按 `lock` 调用顺序逐个执行；不同键之间完全并行；
//! - 任务体 panic 会被捕获、记录，并以 `internal.task_panicked` 完成，键照常释放；
//! - 任务体执行期间不持有任何锁；`DashMap` 分片锁只在登记/释放的瞬间持有；
//! - 完成信号在键释放之后触发，`lock` 返回的信号完成时该任务已不再占用键；
//! - `shutdown` 之后的 `lock` 立即以 `internal.shutdown` 失败，之前受理的任务全部执行完毕后工作线程才退出。
//!
//! # 风险提示（Trade-offs）
//! - 在任务体内对同一键再次 `lock` 并阻塞等待其结果会自锁：新任务排在当前任务之后。

use std::{
    collections::VecDeque,
    fmt,
    hash::Hash,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_queue::SegQueue;
use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::{Condvar, Mutex};

use crate::{
    error::{CoreError, codes, panic_to_error},
    future::Completion,
};

/// 任务完成信号。
pub type TaskCompletion = Completion<Result<(), CoreError>>;

const IDLE_PARK: Duration = Duration::from_millis(50);

type TaskBody = Box<dyn FnOnce() + Send + 'static>;

struct ActorTask<K> {
    id: u64,
    key: K,
    // 等待中的任务存放在 `DashMap` 里，要求 `Sync`；任务体只在执行时取出一次。
    body: Mutex<TaskBody>,
    done: TaskCompletion,
}

struct TaskLock<K> {
    current: u64,
    pending: VecDeque<ActorTask<K>>,
}

struct Shared<K> {
    global: SegQueue<ActorTask<K>>,
    locks: DashMap<K, TaskLock<K>>,
    idle: Mutex<()>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    /// 已受理但尚未完成的任务数，包括挂在各键等待队列中的任务。
    in_flight: AtomicUsize,
    next_id: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// 固定工作线程池 + 每键等待队列。
///
/// ```rust
/// use fai_core::actor::ActorSerializer;
/// use std::sync::{Arc, Mutex};
///
/// let actor = ActorSerializer::<&'static str>::start(2).unwrap();
/// let log = Arc::new(Mutex::new(Vec::new()));
/// let last = (0..3)
///     .map(|n| {
///         let log = Arc::clone(&log);
///         actor.lock("account-1", move || log.lock().unwrap().push(n))
///     })
///     .last()
///     .unwrap();
/// last.wait().unwrap();
/// assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
/// actor.shutdown();
/// ```
pub struct ActorSerializer<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for ActorSerializer<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> ActorSerializer<K>
where
    K: Hash + Eq + Clone + Send + Sync + fmt::Debug + 'static,
{
    /// 启动 `workers` 个工作线程。
    pub fn start(workers: usize) -> Result<Self, CoreError> {
        let shared = Arc::new(Shared {
            global: SegQueue::new(),
            locks: DashMap::new(),
            idle: Mutex::new(()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            workers: Mutex::new(Vec::with_capacity(workers)),
        });
        for index in 0..workers.max(1) {
            let runner = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("fai-actor-{index}"))
                .spawn(move || runner.work())
                .map_err(|err| {
                    CoreError::from_io(codes::INTERNAL_SPAWN, "spawn actor worker", err)
                })?;
            shared.workers.lock().push(handle);
        }
        Ok(Self { shared })
    }

    /// 以键 `key` 串行执行 `task`。
    pub fn lock(&self, key: K, task: impl FnOnce() + Send + 'static) -> TaskCompletion {
        let done = Completion::new();
        // 先登记再检查停止标志：工作线程只在 `in_flight == 0` 时退出，两侧都用 SeqCst，
        // 要么这里看到停止并拒绝，要么工作线程看到本任务并继续运行。
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.shared.shutdown.load(Ordering::SeqCst) {
            self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            done.fire_done(Err(CoreError::new(
                codes::INTERNAL_SHUTDOWN,
                "actor serializer is shut down",
            )));
            return done;
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.submit(ActorTask {
            id,
            key,
            body: Mutex::new(Box::new(task)),
            done: done.clone(),
        });
        done
    }

    /// 当前持有或等待中的键数量。
    pub fn active_keys(&self) -> usize {
        self.shared.locks.len()
    }

    /// 停止接收新任务，排空已提交任务后回收工作线程。
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        {
            let _guard = self.shared.idle.lock();
            self.shared.wakeup.notify_all();
        }
        let workers = std::mem::take(&mut *self.shared.workers.lock());
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::error!("actor worker terminated abnormally");
            }
        }
    }
}

impl<K> fmt::Debug for ActorSerializer<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorSerializer")
            .field("queued", &self.shared.global.len())
            .field("shutdown", &self.shared.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K> Shared<K>
where
    K: Hash + Eq + Clone + Send + Sync + fmt::Debug + 'static,
{
    fn submit(&self, task: ActorTask<K>) {
        if let Some(runnable) = self.acquire(task) {
            self.global.push(runnable);
            let _guard = self.idle.lock();
            self.wakeup.notify_one();
        }
    }

    /// 键空闲或请求者即当前持有者时返回任务以便立即执行，否则挂入等待队列。
    fn acquire(&self, task: ActorTask<K>) -> Option<ActorTask<K>> {
        match self.locks.entry(task.key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(TaskLock {
                    current: task.id,
                    pending: VecDeque::new(),
                });
                Some(task)
            }
            Entry::Occupied(mut slot) => {
                if slot.get().current == task.id {
                    Some(task)
                } else {
                    slot.get_mut().pending.push_back(task);
                    None
                }
            }
        }
    }

    fn release(&self, key: &K) {
        let successor = match self.locks.entry(key.clone()) {
            Entry::Occupied(mut slot) => match slot.get_mut().pending.pop_front() {
                Some(next) => {
                    slot.get_mut().current = next.id;
                    Some(next)
                }
                None => {
                    slot.remove();
                    None
                }
            },
            Entry::Vacant(_) => None,
        };
        if let Some(next) = successor {
            self.submit(next);
        }
    }

    fn work(&self) {
        loop {
            if let Some(task) = self.global.pop() {
                self.run(task);
                continue;
            }
            if self.shutdown.load(Ordering::SeqCst) && self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            let mut guard = self.idle.lock();
            if self.global.is_empty() {
                self.wakeup.wait_for(&mut guard, IDLE_PARK);
            }
        }
    }

    fn run(&self, task: ActorTask<K>) {
        let ActorTask { id, key, body, done } = task;
        let outcome = catch_unwind(AssertUnwindSafe(body.into_inner())).map_err(|payload| {
            let err = panic_to_error(codes::INTERNAL_TASK_PANICKED, payload);
            tracing::error!(task = id, key = ?key, error = %err, "actor task panicked");
            err
        });
        // 先释放键再通知等待者：等待者醒来时键已交给后继任务或已删除。
        self.release(&key);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        done.fire_done(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_dropped_once_its_queue_drains() {
        let actor = ActorSerializer::<u32>::start(1).unwrap();
        actor.lock(7, || {}).wait().unwrap();
        assert_eq!(actor.active_keys(), 0);
        actor.shutdown();
    }

    #[test]
    fn lock_after_shutdown_is_rejected() {
        let actor = ActorSerializer::<u32>::start(1).unwrap();
        actor.shutdown();
        let err = actor.lock(1, || {}).wait().unwrap_err();
        assert_eq!(err.code(), codes::INTERNAL_SHUTDOWN);
    }
}
