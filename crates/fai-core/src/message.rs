use std::{any::Any, fmt};

use crate::{
    buffer::ByteBuffer,
    error::{CoreError, codes},
};

/// 过滤链上流动的消息信封。
///
/// # 设计背景（Why）
/// - 链的底部只认识字节，顶部只认识业务对象（FAI 帧、HTTP 响应……），中间的编解码过滤器负责转换；
/// - 统一信封让同一条链既能搬运原始字节，也能搬运解码结果，而不必为每种协议定义一套泛型链。
///
/// # 契约说明（What）
/// - [`Message::Buffer`]：原始字节，反应器读入与最终写出都使用此变体；
/// - [`Message::User`]：解码后的业务对象，通过 [`Message::downcast`] 按类型取回。
pub enum Message {
    Buffer(ByteBuffer),
    User(Box<dyn Any + Send>),
}

impl Message {
    /// 包装任意业务对象。
    pub fn user<T: Any + Send>(value: T) -> Self {
        Message::User(Box::new(value))
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self, Message::Buffer(_))
    }

    /// 取出字节变体，否则返回 `protocol.unexpected_message`。
    pub fn into_buffer(self) -> Result<ByteBuffer, CoreError> {
        match self {
            Message::Buffer(buffer) => Ok(buffer),
            Message::User(_) => Err(CoreError::new(
                codes::PROTOCOL_UNEXPECTED_MESSAGE,
                "expected raw bytes, found a decoded object",
            )),
        }
    }

    /// 按类型取出业务对象；类型不符时原样退回。
    pub fn downcast<T: Any + Send>(self) -> Result<T, Message> {
        match self {
            Message::User(value) => value
                .downcast::<T>()
                .map(|boxed| *boxed)
                .map_err(Message::User),
            other => Err(other),
        }
    }

    /// 借用查看业务对象。
    pub fn downcast_ref<T: Any + Send>(&self) -> Option<&T> {
        match self {
            Message::User(value) => value.downcast_ref::<T>(),
            Message::Buffer(_) => None,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Buffer(buffer) => f.debug_tuple("Buffer").field(buffer).finish(),
            Message::User(_) => f.write_str("User(..)"),
        }
    }
}

impl From<ByteBuffer> for Message {
    fn from(value: ByteBuffer) -> Self {
        Message::Buffer(value)
    }
}

impl From<Vec<u8>> for Message {
    fn from(value: Vec<u8>) -> Self {
        Message::Buffer(ByteBuffer::wrap(value))
    }
}

impl From<&[u8]> for Message {
    fn from(value: &[u8]) -> Self {
        Message::Buffer(ByteBuffer::copy_from_slice(value))
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Message::from(value.as_bytes())
    }
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        Message::from(value.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_returns_mismatches_untouched() {
        let message = Message::user(42u32);
        let message = message.downcast::<String>().unwrap_err();
        assert_eq!(message.downcast_ref::<u32>(), Some(&42));
        assert_eq!(message.downcast::<u32>().unwrap(), 42);
    }

    #[test]
    fn strings_become_buffers() {
        let buffer = Message::from("ping").into_buffer().unwrap();
        assert_eq!(buffer.readable().unwrap(), b"ping");
        let err = Message::user(()).into_buffer().unwrap_err();
        assert_eq!(err.code(), codes::PROTOCOL_UNEXPECTED_MESSAGE);
    }
}
