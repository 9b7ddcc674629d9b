use std::{
    fmt,
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;

use crate::{error::CoreError, future::Completion, timer::Timer};

/// 流的消费端。
///
/// `on_error` 与 `on_complete` 互斥且至多调用一次，之后不会再收到任何事件。
pub trait Subscriber<T>: Send + 'static {
    fn on_next(&mut self, item: T);

    fn on_error(&mut self, error: CoreError);

    fn on_complete(&mut self);
}

type Slot<T> = Arc<Mutex<Option<Box<dyn Subscriber<T>>>>>;

/// 生产端句柄，可克隆后跨线程推送事件。
///
/// # 契约说明（What）
/// - 终止事件（错误/完成）之后的推送被静默丢弃，`next` 返回 `false` 提示生产者停止；
/// - `on_next` 在内部锁下执行，订阅者不得在回调内向同一个 `Emitter` 再次推送。
pub struct Emitter<T> {
    slot: Slot<T>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Send + 'static> Emitter<T> {
    fn new(subscriber: Box<dyn Subscriber<T>>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(subscriber))),
        }
    }

    /// 推送元素；下游已终止时返回 `false`。
    pub fn next(&self, item: T) -> bool {
        match self.slot.lock().as_mut() {
            Some(subscriber) => {
                subscriber.on_next(item);
                true
            }
            None => false,
        }
    }

    pub fn error(&self, error: CoreError) {
        let subscriber = self.slot.lock().take();
        if let Some(mut subscriber) = subscriber {
            subscriber.on_error(error);
        }
    }

    pub fn complete(&self) {
        let subscriber = self.slot.lock().take();
        if let Some(mut subscriber) = subscriber {
            subscriber.on_complete();
        }
    }

    /// 丢弃订阅者且不发送任何终止事件，对应“连接关闭即取消”的语义。
    pub fn abandon(&self) {
        self.slot.lock().take();
    }

    pub fn is_terminated(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl<T: Send + 'static> Subscriber<T> for Emitter<T> {
    fn on_next(&mut self, item: T) {
        self.next(item);
    }

    fn on_error(&mut self, error: CoreError) {
        self.error(error);
    }

    fn on_complete(&mut self) {
        self.complete();
    }
}

type Producer<T> = Box<dyn FnOnce(Emitter<T>) + Send + 'static>;

/// 冷启动、推模式、单订阅的异步序列。
///
/// # 设计背景（Why）
/// - “先取 A，再取 B，失败则换路重试，间隔一段时间”这类流程不能阻塞反应器线程，
///   用算子组合描述流程，真正的执行推迟到 [`Subscription::start`]；
/// - 没有独立的取消信号：连接关闭后用 [`Stream::until`] 截断，订阅者不再被调用。
///
/// # 执行逻辑（How）
/// - 每个 `Stream` 只是一个尚未执行的生产闭包，算子把上游闭包包进新的闭包；
/// - `subscribe` 只建立 `Emitter`，`start` 才调用生产闭包，因此组合本身没有副作用。
///
/// ```rust
/// use fai_core::future::Stream;
///
/// let result = Stream::from_iter(vec![1, 2, 3])
///     .map(|n| n * 10)
///     .collect()
///     .wait();
/// assert_eq!(result.unwrap(), vec![10, 20, 30]);
/// ```
pub struct Stream<T> {
    producer: Producer<T>,
}

impl<T: Send + 'static> Stream<T> {
    /// 以生产闭包构造流；闭包在 `start` 时获得 `Emitter`。
    pub fn create(producer: impl FnOnce(Emitter<T>) + Send + 'static) -> Self {
        Self {
            producer: Box::new(producer),
        }
    }

    pub fn just(item: T) -> Self {
        Self::create(move |emitter| {
            emitter.next(item);
            emitter.complete();
        })
    }

    pub fn empty() -> Self {
        Self::create(|emitter| emitter.complete())
    }

    pub fn failed(error: CoreError) -> Self {
        Self::create(move |emitter| emitter.error(error))
    }

    pub fn from_iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let items = items.into_iter();
        Self::create(move |emitter| {
            for item in items {
                if !emitter.next(item) {
                    return;
                }
            }
            emitter.complete();
        })
    }

    /// 把一次性结果桥接为单元素流。
    pub fn from_completion(completion: Completion<Result<T, CoreError>>) -> Self
    where
        T: Clone,
    {
        Self::create(move |emitter| {
            completion.add_listener(move |result| match result {
                Ok(item) => {
                    emitter.next(item.clone());
                    emitter.complete();
                }
                Err(error) => emitter.error(error.clone()),
            });
        })
    }

    pub fn map<U: Send + 'static>(self, f: impl FnMut(T) -> U + Send + 'static) -> Stream<U> {
        Stream::create(move |downstream| {
            self.run(MapSubscriber {
                downstream,
                f,
                _marker: PhantomData,
            })
        })
    }

    /// 每个元素展开为一个子流，全部子流与上游都完成后下游才完成；任一错误立即终止。
    pub fn flat_map<U: Send + 'static>(
        self,
        f: impl FnMut(T) -> Stream<U> + Send + 'static,
    ) -> Stream<U> {
        Stream::create(move |downstream| {
            let active = Arc::new(AtomicUsize::new(1));
            self.run(FlatMapSubscriber {
                downstream,
                active,
                f,
                _marker: PhantomData,
            })
        })
    }

    /// 出错时交给 `on_error` 决定是否换一个流继续；返回 `None` 则把错误传给下游。
    pub fn retry(
        self,
        on_error: impl FnMut(&CoreError) -> Option<Stream<T>> + Send + 'static,
    ) -> Stream<T> {
        Stream::create(move |downstream| {
            self.run(RetrySubscriber {
                downstream,
                on_error: Some(on_error),
            })
        })
    }

    /// 延迟 `delay` 后再订阅上游，等待期间不占用任何线程。
    pub fn sleep(self, delay: Duration, timer: &Timer) -> Stream<T> {
        let timer = timer.clone();
        Stream::create(move |downstream: Emitter<T>| {
            timer.schedule(delay, move || self.run(downstream));
        })
    }

    /// `alive` 返回 `false` 后静默丢弃后续所有事件。
    pub fn until(self, alive: impl Fn() -> bool + Send + 'static) -> Stream<T> {
        Stream::create(move |downstream| self.run(UntilSubscriber { downstream, alive }))
    }

    /// 建立订阅但不启动。
    pub fn subscribe(self, subscriber: impl Subscriber<T>) -> Subscription<T> {
        Subscription {
            producer: Some(self.producer),
            emitter: Emitter::new(Box::new(subscriber)),
        }
    }

    /// 订阅并启动，收集所有元素。
    pub fn collect(self) -> Completion<Result<Vec<T>, CoreError>>
    where
        T: Clone,
    {
        let done = Completion::new();
        self.run(Collector {
            items: Vec::new(),
            done: done.clone(),
        });
        done
    }

    fn run(self, subscriber: impl Subscriber<T>) {
        (self.producer)(Emitter::new(Box::new(subscriber)));
    }
}

impl<T> fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Stream(..)")
    }
}

/// 订阅句柄。
pub struct Subscription<T> {
    producer: Option<Producer<T>>,
    emitter: Emitter<T>,
}

impl<T: Send + 'static> Subscription<T> {
    /// 开始执行；重复调用无效。
    pub fn start(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer(self.emitter.clone());
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.emitter.is_terminated()
    }
}

struct MapSubscriber<T, U, F> {
    downstream: Emitter<U>,
    f: F,
    _marker: PhantomData<fn(T)>,
}

impl<T, U, F> Subscriber<T> for MapSubscriber<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> U + Send + 'static,
{
    fn on_next(&mut self, item: T) {
        self.downstream.next((self.f)(item));
    }

    fn on_error(&mut self, error: CoreError) {
        self.downstream.error(error);
    }

    fn on_complete(&mut self) {
        self.downstream.complete();
    }
}

struct FlatMapSubscriber<T, U, F> {
    downstream: Emitter<U>,
    active: Arc<AtomicUsize>,
    f: F,
    _marker: PhantomData<fn(T)>,
}

impl<T, U, F> Subscriber<T> for FlatMapSubscriber<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Stream<U> + Send + 'static,
{
    fn on_next(&mut self, item: T) {
        if self.downstream.is_terminated() {
            return;
        }
        self.active.fetch_add(1, Ordering::AcqRel);
        (self.f)(item).run(InnerSubscriber {
            downstream: self.downstream.clone(),
            active: Arc::clone(&self.active),
        });
    }

    fn on_error(&mut self, error: CoreError) {
        self.downstream.error(error);
    }

    fn on_complete(&mut self) {
        finish_one(&self.active, &self.downstream);
    }
}

struct InnerSubscriber<U> {
    downstream: Emitter<U>,
    active: Arc<AtomicUsize>,
}

impl<U: Send + 'static> Subscriber<U> for InnerSubscriber<U> {
    fn on_next(&mut self, item: U) {
        self.downstream.next(item);
    }

    fn on_error(&mut self, error: CoreError) {
        self.downstream.error(error);
    }

    fn on_complete(&mut self) {
        finish_one(&self.active, &self.downstream);
    }
}

fn finish_one<U: Send + 'static>(active: &AtomicUsize, downstream: &Emitter<U>) {
    if active.fetch_sub(1, Ordering::AcqRel) == 1 {
        downstream.complete();
    }
}

struct RetrySubscriber<T, F> {
    downstream: Emitter<T>,
    on_error: Option<F>,
}

impl<T, F> Subscriber<T> for RetrySubscriber<T, F>
where
    T: Send + 'static,
    F: FnMut(&CoreError) -> Option<Stream<T>> + Send + 'static,
{
    fn on_next(&mut self, item: T) {
        self.downstream.next(item);
    }

    fn on_error(&mut self, error: CoreError) {
        let Some(mut decide) = self.on_error.take() else {
            self.downstream.error(error);
            return;
        };
        match decide(&error) {
            Some(fallback) => {
                tracing::debug!(code = error.code(), "stream failed; switching to fallback");
                fallback.run(RetrySubscriber {
                    downstream: self.downstream.clone(),
                    on_error: Some(decide),
                });
            }
            None => self.downstream.error(error),
        }
    }

    fn on_complete(&mut self) {
        self.downstream.complete();
    }
}

struct UntilSubscriber<T, F> {
    downstream: Emitter<T>,
    alive: F,
}

impl<T, F> UntilSubscriber<T, F>
where
    T: Send + 'static,
    F: Fn() -> bool + Send + 'static,
{
    fn check(&self) -> bool {
        if (self.alive)() {
            return true;
        }
        self.downstream.abandon();
        false
    }
}

impl<T, F> Subscriber<T> for UntilSubscriber<T, F>
where
    T: Send + 'static,
    F: Fn() -> bool + Send + 'static,
{
    fn on_next(&mut self, item: T) {
        if self.check() {
            self.downstream.next(item);
        }
    }

    fn on_error(&mut self, error: CoreError) {
        if self.check() {
            self.downstream.error(error);
        }
    }

    fn on_complete(&mut self) {
        if self.check() {
            self.downstream.complete();
        }
    }
}

struct Collector<T: Clone + Send + 'static> {
    items: Vec<T>,
    done: Completion<Result<Vec<T>, CoreError>>,
}

impl<T: Clone + Send + 'static> Subscriber<T> for Collector<T> {
    fn on_next(&mut self, item: T) {
        self.items.push(item);
    }

    fn on_error(&mut self, error: CoreError) {
        self.done.fire_done(Err(error));
    }

    fn on_complete(&mut self) {
        self.done.fire_done(Ok(std::mem::take(&mut self.items)));
    }
}
