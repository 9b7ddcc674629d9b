use std::{fmt, sync::Arc};

use crate::{error::CoreError, message::Message, session::Session};

use super::{
    filter::{Filter, FilterContext},
    handler::ConnectionHandler,
};

/// 构建完成即冻结的过滤链。
///
/// # 契约说明（What）
/// - 过滤器顺序在 [`FilterChainBuilder::build`] 时确定，之后不可修改；
/// - 克隆只复制两个 `Arc`，每条连接持有一份克隆；
/// - 所有入口都在连接所属的反应器线程上调用。
///
/// ```rust
/// use fai_core::pipeline::{ConnectionHandler, FilterChain};
/// use fai_core::{error::CoreError, message::Message, session::Session};
///
/// struct Echo;
/// impl ConnectionHandler for Echo {
///     fn on_read(&self, session: &dyn Session, message: Message) -> Result<(), CoreError> {
///         session.write(message);
///         Ok(())
///     }
/// }
///
/// let chain = FilterChain::builder(Echo).build();
/// assert!(chain.filter_names().is_empty());
/// ```
#[derive(Clone)]
pub struct FilterChain {
    filters: Arc<[Arc<dyn Filter>]>,
    handler: Arc<dyn ConnectionHandler>,
}

impl FilterChain {
    pub fn builder(handler: impl ConnectionHandler) -> FilterChainBuilder {
        FilterChainBuilder {
            filters: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    pub fn handler(&self) -> &Arc<dyn ConnectionHandler> {
        &self.handler
    }

    pub fn filter_names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|filter| filter.name()).collect()
    }

    /// 连接建立：自链首开始。
    pub fn fire_connect(&self, session: &dyn Session) -> Result<(), CoreError> {
        self.connect_from(session, 0)
    }

    /// 收到字节：自链首开始。
    pub fn fire_read(&self, session: &dyn Session, message: Message) -> Result<(), CoreError> {
        self.read_from(session, 0, message)
    }

    /// 业务写出：自链尾开始逆序编码。
    pub fn fire_write(&self, session: &dyn Session, message: Message) -> Result<(), CoreError> {
        self.write_below(session, self.filters.len(), message)
    }

    /// 连接关闭：业务处理器先行，随后自链尾向链首。
    pub fn fire_close(&self, session: &dyn Session) {
        self.handler.on_close(session);
        self.close_below(session, self.filters.len());
    }

    /// 错误通知：顺序同关闭。
    pub fn fire_error(&self, session: &dyn Session, error: &CoreError) {
        self.handler.on_error(session, error);
        self.error_below(session, self.filters.len(), error);
    }

    pub(crate) fn connect_from(&self, session: &dyn Session, index: usize) -> Result<(), CoreError> {
        match self.filters.get(index) {
            Some(filter) => filter.on_connect(&FilterContext::new(self, session, index)),
            None => self.handler.on_connect(session),
        }
    }

    pub(crate) fn read_from(
        &self,
        session: &dyn Session,
        index: usize,
        message: Message,
    ) -> Result<(), CoreError> {
        match self.filters.get(index) {
            Some(filter) => filter.on_read(&FilterContext::new(self, session, index), message),
            None => self.handler.on_read(session, message),
        }
    }

    pub(crate) fn write_below(
        &self,
        session: &dyn Session,
        index: usize,
        message: Message,
    ) -> Result<(), CoreError> {
        match index.checked_sub(1) {
            Some(below) => {
                self.filters[below].on_write(&FilterContext::new(self, session, below), message)
            }
            None => session.transmit(message.into_buffer()?),
        }
    }

    pub(crate) fn close_below(&self, session: &dyn Session, index: usize) {
        if let Some(below) = index.checked_sub(1) {
            self.filters[below].on_close(&FilterContext::new(self, session, below));
        }
    }

    pub(crate) fn error_below(&self, session: &dyn Session, index: usize, error: &CoreError) {
        if let Some(below) = index.checked_sub(1) {
            self.filters[below].on_error(&FilterContext::new(self, session, below), error);
        }
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.filter_names())
            .finish()
    }
}

/// 过滤链构建器，`add_last` 的顺序即链首到链尾的顺序。
pub struct FilterChainBuilder {
    filters: Vec<Arc<dyn Filter>>,
    handler: Arc<dyn ConnectionHandler>,
}

impl FilterChainBuilder {
    pub fn add_last(mut self, filter: impl Filter) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// 追加已共享的过滤器实例。
    pub fn add_shared(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn build(self) -> FilterChain {
        FilterChain {
            filters: self.filters.into(),
            handler: self.handler,
        }
    }
}
