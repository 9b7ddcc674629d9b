use std::{fmt, sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};

/// 监听器注册句柄，用于 [`Completion::remove_listener`]。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<T> = Box<dyn FnOnce(&T) + Send + 'static>;

struct State<T> {
    value: Option<T>,
    listeners: Vec<(ListenerId, Listener<T>)>,
    next_id: u64,
    /// `fire_done` 正在锁外调用监听器；此时新注册的监听器排在队尾，由同一线程接着执行。
    firing: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    done: Condvar,
}

/// 一次性完成信号：单次赋值 + 阻塞等待 + 按注册顺序回调的监听器。
///
/// # 设计背景（Why）
/// - 业务线程需要等待“连接建立”“写出完成”等结果，而反应器线程绝不能阻塞，
///   因此同一对象既提供 [`Completion::wait`] 给普通线程，也提供监听器给反应器线程；
/// - 多个监听者可能关心同一结果，值需 `Clone` 后分发。
///
/// # 执行逻辑（How）
/// - [`Completion::fire_done`] 在锁内写入值并取走监听器列表，随后在锁外依注册顺序调用，
///   监听器内部再次访问本对象不会死锁；
/// - 完成后注册的监听器在 [`Completion::add_listener`] 内立即执行，不存在丢失唤醒；
///   若 `fire_done` 仍在调用先前的监听器，则新监听器排到队尾，由触发线程在它们之后执行。
///
/// # 契约说明（What）
/// - 仅首个 `fire_done` 生效，之后的调用返回 `false` 且不再触发任何监听器；
/// - 每个监听器最多执行一次，且全部监听器严格按注册顺序先后执行，互不并发；
/// - [`Completion::wait`] 在值写入后即返回，不等待监听器执行完毕。
///
/// ```rust
/// use fai_core::future::Completion;
/// use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
///
/// let done = Completion::new();
/// let hits = Arc::new(AtomicUsize::new(0));
/// let seen = Arc::clone(&hits);
/// done.add_listener(move |v: &u8| { seen.fetch_add(*v as usize, Ordering::SeqCst); });
/// assert!(done.fire_done(2));
/// assert!(!done.fire_done(5));
/// assert_eq!(hits.load(Ordering::SeqCst), 2);
/// ```
pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Completion<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    value: None,
                    listeners: Vec::new(),
                    next_id: 0,
                    firing: false,
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// 构造已完成的信号。
    pub fn completed(value: T) -> Self {
        let completion = Self::new();
        completion.fire_done(value);
        completion
    }

    /// 设置结果并唤醒等待者；只有第一次调用返回 `true`。
    pub fn fire_done(&self, value: T) -> bool {
        let mut listeners = {
            let mut state = self.inner.state.lock();
            if state.value.is_some() {
                return false;
            }
            state.value = Some(value.clone());
            state.firing = true;
            std::mem::take(&mut state.listeners)
        };
        self.inner.done.notify_all();
        loop {
            for (_, listener) in listeners {
                listener(&value);
            }
            let mut state = self.inner.state.lock();
            if state.listeners.is_empty() {
                state.firing = false;
                return true;
            }
            listeners = std::mem::take(&mut state.listeners);
        }
    }

    /// 注册完成回调；若已完成且没有监听器在执行，则在当前线程立即执行。
    pub fn add_listener(&self, listener: impl FnOnce(&T) + Send + 'static) -> ListenerId {
        let mut state = self.inner.state.lock();
        let id = ListenerId(state.next_id);
        state.next_id += 1;
        match state.value.clone() {
            Some(value) if !state.firing => {
                drop(state);
                listener(&value);
            }
            _ => state.listeners.push((id, Box::new(listener))),
        }
        id
    }

    /// 撤销尚未执行的监听器。
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(candidate, _)| *candidate != id);
        before != state.listeners.len()
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().value.is_some()
    }

    /// 非阻塞读取结果。
    pub fn try_get(&self) -> Option<T> {
        self.inner.state.lock().value.clone()
    }

    /// 阻塞直至完成。禁止在反应器线程调用。
    pub fn wait(&self) -> T {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(value) = state.value.clone() {
                return value;
            }
            self.inner.done.wait(&mut state);
        }
    }

    /// 带超时的阻塞等待，超时返回 `None`。
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(value) = state.value.clone() {
                return Some(value);
            }
            if self.inner.done.wait_until(&mut state, deadline).timed_out() {
                return state.value.clone();
            }
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Completion")
            .field("done", &state.value.is_some())
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        thread,
    };

    #[test]
    fn listeners_run_in_registration_order() {
        let done = Completion::<u32>::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..4 {
            let order = Arc::clone(&order);
            done.add_listener(move |_| order.lock().push(tag));
        }
        done.fire_done(1);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn removed_listener_never_fires() {
        let done = Completion::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = done.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(done.remove_listener(id));
        done.fire_done(());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!done.remove_listener(id));
    }

    #[test]
    fn wait_is_released_by_another_thread() {
        let done = Completion::<&'static str>::new();
        let remote = done.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.fire_done("ok");
        });
        assert_eq!(done.wait(), "ok");
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires() {
        let done = Completion::<u8>::new();
        assert_eq!(done.wait_timeout(Duration::from_millis(10)), None);
        done.fire_done(3);
        assert_eq!(done.wait_timeout(Duration::from_millis(10)), Some(3));
    }

    #[test]
    fn listener_may_touch_the_completion_it_watches() {
        let done = Completion::<u8>::new();
        let inner = done.clone();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in = Arc::clone(&seen);
        done.add_listener(move |_| {
            assert!(inner.is_done());
            seen_in.store(inner.try_get().unwrap_or(0) as usize, Ordering::SeqCst);
        });
        done.fire_done(9);
        assert_eq!(seen.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn late_listener_waits_for_listeners_still_running() {
        let done = Completion::<u8>::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let first = Arc::clone(&order);
        done.add_listener(move |_| {
            entered_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            first.lock().push("early");
        });

        let remote = done.clone();
        let firing = thread::spawn(move || remote.fire_done(1));
        entered_rx.recv().unwrap();
        assert!(done.is_done());

        let late = Arc::clone(&order);
        done.add_listener(move |_| late.lock().push("late"));
        assert!(order.lock().is_empty());

        release_tx.send(()).unwrap();
        assert!(firing.join().unwrap());
        assert_eq!(*order.lock(), vec!["early", "late"]);

        let after = Arc::clone(&order);
        done.add_listener(move |_| after.lock().push("after"));
        assert_eq!(order.lock().len(), 3);
    }

    #[test]
    fn listener_registered_from_a_listener_runs_after_the_batch() {
        let done = Completion::<u8>::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let inner = done.clone();
        let nested = Arc::clone(&order);
        done.add_listener(move |_| {
            let tail = Arc::clone(&nested);
            inner.add_listener(move |_| tail.lock().push(2));
            nested.lock().push(0);
        });
        let second = Arc::clone(&order);
        done.add_listener(move |_| second.lock().push(1));
        done.fire_done(5);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
