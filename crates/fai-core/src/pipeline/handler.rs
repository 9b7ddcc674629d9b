use crate::{error::CoreError, message::Message, session::Session};

/// 业务处理器：过滤链的终点。
///
/// # 契约说明（What）
/// - `on_read` 收到的是最后一个过滤器转发的消息，可能是原始字节，也可能是解码后的对象；
/// - `on_read`/`on_connect` 返回错误会触发 `on_error` 并关闭连接；
/// - `on_error` 在连接拆除前至多调用一次，`on_close` 恰好调用一次。
///
/// 回调运行在反应器线程上，不得阻塞；耗时工作应交给 `ActorSerializer` 或独立线程，
/// 结果经 [`Session::write`] 回写。
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_connect(&self, session: &dyn Session) -> Result<(), CoreError> {
        let _ = session;
        Ok(())
    }

    fn on_read(&self, session: &dyn Session, message: Message) -> Result<(), CoreError>;

    fn on_error(&self, session: &dyn Session, error: &CoreError) {
        tracing::debug!(session = %session.id(), code = error.code(), error = %error, "unhandled connection error");
    }

    fn on_close(&self, session: &dyn Session) {
        let _ = session;
    }
}
