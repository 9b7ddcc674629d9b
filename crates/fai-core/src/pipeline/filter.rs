use crate::{error::CoreError, message::Message, session::Session};

use super::chain::FilterChain;

/// 可插拔的协议处理阶段。
///
/// # 设计背景（Why）
/// - 成帧、加密协商、代理握手、应用编解码各自只关心少数几个事件；
///   未覆写的能力默认原样透传，实现者只写自己需要的那部分。
///
/// # 契约说明（What）
/// - 过滤器本身无状态、可被多条连接共享；每连接状态放在 [`Session::attributes`] 中；
/// - `on_read` 必须可重入：同一逻辑消息可能被拆成任意多次投递，消息不完整时缓存并直接返回 `Ok(())`；
/// - 返回 `Err` 不会被吞掉：连接把错误沿同一条链逆序通知，再进入关闭流程。
///
/// # 执行逻辑（How）
/// - 入站：`ctx.fire_connect()` / `ctx.fire_read(msg)` 交给链上的下一个过滤器或业务处理器；
/// - 出站：`ctx.write(msg)` 交给更靠近套接字的过滤器，越过链首后进入线路写队列；
/// - 关闭/错误：`ctx.fire_close()` / `ctx.fire_error(err)` 继续向链首传递。
pub trait Filter: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn on_connect(&self, ctx: &FilterContext<'_>) -> Result<(), CoreError> {
        ctx.fire_connect()
    }

    fn on_read(&self, ctx: &FilterContext<'_>, message: Message) -> Result<(), CoreError> {
        ctx.fire_read(message)
    }

    fn on_write(&self, ctx: &FilterContext<'_>, message: Message) -> Result<(), CoreError> {
        ctx.write(message)
    }

    fn on_close(&self, ctx: &FilterContext<'_>) {
        ctx.fire_close();
    }

    fn on_error(&self, ctx: &FilterContext<'_>, error: &CoreError) {
        ctx.fire_error(error);
    }
}

/// 过滤器在链上的位置句柄。
pub struct FilterContext<'a> {
    chain: &'a FilterChain,
    session: &'a dyn Session,
    index: usize,
}

impl<'a> FilterContext<'a> {
    pub(crate) fn new(chain: &'a FilterChain, session: &'a dyn Session, index: usize) -> Self {
        Self {
            chain,
            session,
            index,
        }
    }

    pub fn session(&self) -> &'a dyn Session {
        self.session
    }

    /// 当前过滤器在链上的下标，链首为 0。
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn fire_connect(&self) -> Result<(), CoreError> {
        self.chain.connect_from(self.session, self.index + 1)
    }

    pub fn fire_read(&self, message: Message) -> Result<(), CoreError> {
        self.chain.read_from(self.session, self.index + 1, message)
    }

    /// 向套接字方向写出，跳过当前过滤器及其后的所有过滤器。
    pub fn write(&self, message: Message) -> Result<(), CoreError> {
        self.chain.write_below(self.session, self.index, message)
    }

    pub fn fire_close(&self) {
        self.chain.close_below(self.session, self.index);
    }

    pub fn fire_error(&self, error: &CoreError) {
        self.chain.error_below(self.session, self.index, error);
    }
}
