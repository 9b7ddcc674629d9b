#![deny(unsafe_code)]
#![doc = "fai-core: 非阻塞网络 IO 引擎的核心契约。"]
#![doc = ""]
#![doc = "本 crate 不接触套接字，只定义各层共享的数据与协作方式："]
#![doc = "- [`buffer`]：带读写游标、可零拷贝切片的字节缓冲；"]
#![doc = "- [`session`] 与 [`pipeline`]：连接状态机、会话契约与双向过滤链；"]
#![doc = "- [`future`]：一次性完成信号与可组合的推模式流；"]
#![doc = "- [`actor`]：按键串行、不在任务体上持锁的执行器；"]
#![doc = "- [`config`] / [`context`]：显式传递的进程级配置与共享资源。"]
#![doc = ""]
#![doc = "传输层（`fai-transport-tcp`）负责把就绪事件翻译成过滤链调用；编解码过滤器位于 `fai-codecs`。"]

pub mod actor;
pub mod attribute;
pub mod buffer;
pub mod config;
pub mod context;
pub mod error;
pub mod future;
pub mod message;
pub mod observability;
pub mod pipeline;
pub mod session;
/// 测试桩命名空间：内存会话与记录型业务处理器，供各 crate 的过滤器测试复用。
pub mod test_stubs;
pub mod timer;

pub use error::{CoreError, ErrorCategory, Result, codes};
pub use message::Message;
pub use session::{ConnectionState, Session, SessionId, WriteFuture};
