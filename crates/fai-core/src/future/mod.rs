//! 异步结果的两种表达：一次性的 [`Completion`] 与可组合的 [`Stream`]。
//!
//! 二者都不依赖异步运行时，回调在触发完成的线程上同步执行；
//! 反应器线程只能使用监听器形式，阻塞等待留给业务线程。

mod completion;
mod stream;

pub use completion::{Completion, ListenerId};
pub use stream::{Emitter, Stream, Subscriber, Subscription};
