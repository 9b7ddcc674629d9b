use std::{borrow::Cow, error::Error, fmt, io, sync::Arc};

/// `CoreError` 是引擎各层共享的稳定错误形态。
///
/// # 设计背景（Why）
/// - 过滤链、连接状态机、执行器与编解码器分属不同 crate，但最终都要把失败交给业务 `on_error`
///   与连接关闭路径；统一的错误码让日志与测试可以按码值断言。
/// - `Completion` 需要把同一个错误分发给多个监听者，因此错误必须可 `Clone`，底层原因以 `Arc` 共享。
///
/// # 契约说明（What）
/// - `code`：稳定的 `<域>.<语义>` 字符串，取值见 [`codes`]；
/// - `message`：面向排障人员的描述；
/// - `category`：对应错误分类（成帧、超时、传输、协议未完成之外的各类失败）；
/// - `cause`：可选底层原因，经 [`Error::source`] 暴露。
///
/// # 风险提示（Trade-offs）
/// - 分类默认由码值前缀推导，自定义码值若不遵守前缀约定，需要显式调用 [`CoreError::with_category`]。
#[derive(Clone)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    category: ErrorCategory,
    cause: Option<Arc<dyn Error + Send + Sync + 'static>>,
}

impl CoreError {
    /// 以码值与描述构造错误，分类由码值前缀推导。
    ///
    /// ```rust
    /// use fai_core::error::{CoreError, ErrorCategory, codes};
    ///
    /// let err = CoreError::new(codes::FRAMING_BAD_MAGIC, "magic 0x0000");
    /// assert_eq!(err.code(), codes::FRAMING_BAD_MAGIC);
    /// assert_eq!(err.category(), ErrorCategory::Framing);
    /// ```
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            category: ErrorCategory::from_code(code),
            cause: None,
        }
    }

    /// 覆盖默认分类。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }

    /// 附加底层原因。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// 将 IO 错误映射为传输/超时类错误，`code` 描述失败的操作。
    pub fn from_io(code: &'static str, operation: &str, error: io::Error) -> Self {
        let category = match error.kind() {
            io::ErrorKind::TimedOut => ErrorCategory::Timeout,
            _ => ErrorCategory::Transport,
        };
        Self::new(code, format!("{operation}: {error}"))
            .with_category(category)
            .with_cause(error)
    }

    /// 连接已关闭时拒绝操作的统一错误。
    pub fn closed(operation: &str) -> Self {
        Self::new(
            codes::CONNECTION_CLOSED,
            format!("{operation} rejected: connection closed"),
        )
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 人类可读描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 错误分类。
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// 底层原因。
    pub fn cause(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// 是否属于超时类错误。
    pub fn is_timeout(&self) -> bool {
        self.category == ErrorCategory::Timeout
    }
}

impl fmt::Debug for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("category", &self.category)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn Error + 'static))
    }
}

impl PartialEq for CoreError {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.category == other.category
    }
}

/// 错误分类，决定连接层的处置方式。
///
/// - `Framing`：魔数/版本/校验和/保留字段非法，拒绝并关闭，不做部分恢复；
/// - `Timeout`：连接、接收、发送预算耗尽；
/// - `Transport`：套接字层失败（复位、EOF）；
/// - `Protocol`：协商或应用层协议违约（SOCKS 拒绝、HTTP 非法头等）；
/// - `Closed`：对已关闭连接的操作；
/// - `Bounds`：缓冲越界或释放后访问；
/// - `Configuration`：配置非法；
/// - `Internal`：回调 panic 等内部故障。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Framing,
    Timeout,
    Transport,
    Protocol,
    Closed,
    Bounds,
    Configuration,
    Internal,
}

impl ErrorCategory {
    fn from_code(code: &str) -> Self {
        match code.split('.').next().unwrap_or_default() {
            "framing" => Self::Framing,
            "timeout" => Self::Timeout,
            "transport" => Self::Transport,
            "protocol" => Self::Protocol,
            "connection" => Self::Closed,
            "buffer" => Self::Bounds,
            "config" => Self::Configuration,
            _ => Self::Internal,
        }
    }
}

/// 框架内统一的结果别名。
pub type Result<T, E = CoreError> = core::result::Result<T, E>;

/// 稳定错误码表。
///
/// 码值一经发布不得改名；新增码值需保持 `<域>.<语义>` 前缀，以便 [`ErrorCategory`] 推导。
pub mod codes {
    pub const FRAMING_BAD_MAGIC: &str = "framing.bad_magic";
    pub const FRAMING_BAD_VERSION: &str = "framing.bad_version";
    pub const FRAMING_BAD_CHECKSUM: &str = "framing.bad_checksum";
    pub const FRAMING_RESERVED: &str = "framing.reserved_not_zero";
    pub const FRAMING_NEGATIVE_LENGTH: &str = "framing.negative_length";
    pub const FRAMING_TOO_LARGE: &str = "framing.too_large";

    pub const TIMEOUT_CONNECT: &str = "timeout.connect";
    pub const TIMEOUT_RECV: &str = "timeout.recv";
    pub const TIMEOUT_SEND: &str = "timeout.send";

    pub const TRANSPORT_BIND: &str = "transport.bind_failed";
    pub const TRANSPORT_ACCEPT: &str = "transport.accept_failed";
    pub const TRANSPORT_CONNECT: &str = "transport.connect_failed";
    pub const TRANSPORT_READ: &str = "transport.read_failed";
    pub const TRANSPORT_WRITE: &str = "transport.write_failed";
    pub const TRANSPORT_CONFIGURE: &str = "transport.configure_failed";
    pub const TRANSPORT_PEER_CLOSED: &str = "transport.peer_closed";
    pub const TRANSPORT_LOOP_UNAVAILABLE: &str = "transport.loop_unavailable";

    pub const PROTOCOL_HTTP: &str = "protocol.http";
    pub const PROTOCOL_SOCKS: &str = "protocol.socks";
    pub const PROTOCOL_TLS: &str = "protocol.tls";
    pub const PROTOCOL_UNEXPECTED_MESSAGE: &str = "protocol.unexpected_message";

    pub const CONNECTION_CLOSED: &str = "connection.closed";
    pub const CONNECTION_ILLEGAL_TRANSITION: &str = "connection.illegal_transition";

    pub const BUFFER_OUT_OF_BOUNDS: &str = "buffer.out_of_bounds";
    pub const BUFFER_RELEASED: &str = "buffer.released";
    pub const BUFFER_SHARED: &str = "buffer.shared";

    pub const CONFIG_INVALID: &str = "config.invalid";
    pub const CONFIG_PARSE: &str = "config.parse";

    pub const INTERNAL_PANIC: &str = "internal.callback_panicked";
    pub const INTERNAL_TASK_PANICKED: &str = "internal.task_panicked";
    pub const INTERNAL_SHUTDOWN: &str = "internal.shutdown";
    pub const INTERNAL_SPAWN: &str = "internal.spawn_failed";
}

/// 把 panic 负载转换为 [`CoreError`]，供回调隔离点使用。
pub fn panic_to_error(code: &'static str, payload: Box<dyn std::any::Any + Send>) -> CoreError {
    let detail = if let Some(text) = payload.downcast_ref::<&'static str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_owned()
    };
    CoreError::new(code, format!("callback panicked: {detail}"))
}
