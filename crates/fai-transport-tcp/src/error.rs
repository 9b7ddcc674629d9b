use std::io;

use fai_core::{
    CoreError,
    error::{ErrorCategory, codes},
};

/// 一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: codes::TRANSPORT_BIND,
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: codes::TRANSPORT_ACCEPT,
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: codes::TRANSPORT_CONNECT,
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: codes::TRANSPORT_READ,
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: codes::TRANSPORT_WRITE,
    message: "tcp write",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: codes::TRANSPORT_CONFIGURE,
    message: "tcp configure",
};
pub(crate) const REGISTER: OperationKind = OperationKind {
    code: codes::TRANSPORT_CONFIGURE,
    message: "poll register",
};

/// 将 IO 错误映射为框架级 `CoreError`，并按错误种类归类。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> CoreError {
    let category = categorize_io_error(&error);
    CoreError::from_io(kind.code, kind.message, error).with_category(category)
}

/// 对端正常关闭写方向（读到 EOF）。
pub(crate) fn peer_closed() -> CoreError {
    CoreError::new(codes::TRANSPORT_PEER_CLOSED, "tcp read: peer closed the connection")
}

/// 事件循环已停止，命令无法投递。
pub(crate) fn loop_unavailable(index: usize) -> CoreError {
    CoreError::new(
        codes::TRANSPORT_LOOP_UNAVAILABLE,
        format!("event loop {index} is not running"),
    )
}

/// 事件循环在命令执行前被中断。
pub(crate) fn interrupted(operation: &str) -> CoreError {
    CoreError::new(
        codes::INTERNAL_SHUTDOWN,
        format!("{operation} dropped: event loop interrupted"),
    )
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    match error.kind() {
        io::ErrorKind::TimedOut => ErrorCategory::Timeout,
        io::ErrorKind::PermissionDenied | io::ErrorKind::Unsupported => {
            ErrorCategory::Configuration
        }
        _ => ErrorCategory::Transport,
    }
}
