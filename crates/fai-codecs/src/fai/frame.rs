use bytes::{BufMut, Bytes, BytesMut};

use super::header::{FaiError, FaiHeader, HEADER_LEN};

/// 一条完整的 FAI 消息。
///
/// 扩展与消息体均为 [`Bytes`]，解码时直接切自累积缓冲，不产生复制。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FaiFrame {
    pub flag: u16,
    pub flow: u32,
    pub aid: u32,
    pub cmd: u16,
    pub result: u16,
    pub wid: u16,
    pub extension: Bytes,
    pub body: Bytes,
}

impl FaiFrame {
    /// 以命令字与消息体构造请求帧。
    pub fn request(aid: u32, cmd: u16, flow: u32, body: impl Into<Bytes>) -> Self {
        Self {
            aid,
            cmd,
            flow,
            body: body.into(),
            ..Self::default()
        }
    }

    /// 构造与本帧同一 `flow` 的响应帧。
    pub fn reply(&self, result: u16, body: impl Into<Bytes>) -> Self {
        Self {
            flag: self.flag,
            flow: self.flow,
            aid: self.aid,
            cmd: self.cmd,
            result,
            wid: self.wid,
            extension: Bytes::new(),
            body: body.into(),
        }
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flag & flag == flag
    }

    /// 编码后的总长度。
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.extension.len() + self.body.len()
    }
}

/// FAI 帧编解码器。
///
/// # 契约说明（What）
/// - `decode` 在数据不足时返回 `Ok(None)` 且不消费任何字节；头部一旦完整即做全部校验，
///   不等待消息体到齐；
/// - 超过 `max_frame_length` 的帧在编码与解码两侧都被拒绝。
#[derive(Clone, Copy, Debug)]
pub struct FaiCodec {
    max_frame_length: usize,
}

impl FaiCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    pub fn encode(&self, frame: &FaiFrame, dst: &mut BytesMut) -> Result<(), FaiError> {
        let length = frame.encoded_len();
        let head_ex_len = u8::try_from(frame.extension.len()).map_err(|_| FaiError::TooLarge {
            length: frame.extension.len(),
            limit: usize::from(u8::MAX),
        })?;
        let body_len = i32::try_from(frame.body.len()).map_err(|_| FaiError::TooLarge {
            length,
            limit: self.max_frame_length,
        })?;
        if length > self.max_frame_length {
            return Err(FaiError::TooLarge {
                length,
                limit: self.max_frame_length,
            });
        }
        let header = FaiHeader {
            head_ex_len,
            body_len,
            flag: frame.flag,
            flow: frame.flow,
            aid: frame.aid,
            cmd: frame.cmd,
            result: frame.result,
            wid: frame.wid,
        };
        dst.reserve(length);
        dst.put_slice(&header.encode());
        dst.put_slice(&frame.extension);
        dst.put_slice(&frame.body);
        Ok(())
    }

    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<FaiFrame>, FaiError> {
        let Some(raw) = src.get(..HEADER_LEN) else {
            return Ok(None);
        };
        let mut head = [0u8; HEADER_LEN];
        head.copy_from_slice(raw);
        let header = FaiHeader::decode(&head)?;
        let length = header.frame_len();
        if length > self.max_frame_length {
            return Err(FaiError::TooLarge {
                length,
                limit: self.max_frame_length,
            });
        }
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(length).freeze();
        let _ = frame.split_to(HEADER_LEN);
        let extension = frame.split_to(usize::from(header.head_ex_len));
        Ok(Some(FaiFrame {
            flag: header.flag,
            flow: header.flow,
            aid: header.aid,
            cmd: header.cmd,
            result: header.result,
            wid: header.wid,
            extension,
            body: frame,
        }))
    }

    pub fn encode_to_bytes(&self, frame: &FaiFrame) -> Result<Bytes, FaiError> {
        let mut dst = BytesMut::with_capacity(frame.encoded_len());
        self.encode(frame, &mut dst)?;
        Ok(dst.freeze())
    }
}
