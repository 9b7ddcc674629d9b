//! 过滤链：连接之上的有序、双向协议处理管线。
//!
//! - 入站事件（连接建立、读）自链首向链尾传递，最终到达业务 [`ConnectionHandler`]；
//! - 出站写出自链尾向链首传递，越过链首后交给会话的线路写队列；
//! - 关闭与错误先通知业务处理器，再自链尾向链首传递，保证清理自业务层向外进行。

mod chain;
mod filter;
mod handler;

pub use chain::{FilterChain, FilterChainBuilder};
pub use filter::{Filter, FilterContext};
pub use handler::ConnectionHandler;
