use bytes::BytesMut;
use fai_core::{
    CoreError, Message,
    attribute::AttributeKey,
    buffer::ByteBuffer,
    pipeline::{Filter, FilterContext},
};

use super::frame::{FaiCodec, FaiFrame};

const CUMULATION: AttributeKey<BytesMut> = AttributeKey::new("fai.cumulation");

/// FAI 成帧过滤器：入站把字节流切成 [`FaiFrame`]，出站把 [`FaiFrame`] 编码成字节。
///
/// # 执行逻辑（How）
/// 1. 从会话属性取出累积缓冲（不存在则新建），追加本次读到的字节；
/// 2. 循环解码，每得到一帧就以 `Message::user(frame)` 转发给下一站；
/// 3. 剩余的半帧放回属性，等待下一次读事件；
/// 4. 任何校验失败直接返回错误，累积缓冲随之丢弃，连接进入关闭流程。
///
/// # 契约说明（What）
/// - 无论字节被拆成多少次投递，得到的帧序列完全一致；
/// - 出站的非帧消息原样下传，便于与其他过滤器叠加。
#[derive(Clone, Copy, Debug)]
pub struct FaiFrameFilter {
    codec: FaiCodec,
}

impl FaiFrameFilter {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            codec: FaiCodec::new(max_frame_length),
        }
    }
}

impl Filter for FaiFrameFilter {
    fn name(&self) -> &'static str {
        "fai-frame"
    }

    fn on_read(&self, ctx: &FilterContext<'_>, message: Message) -> Result<(), CoreError> {
        let incoming = message.into_buffer()?;
        let attributes = ctx.session().attributes();
        let mut cumulation = attributes.take(&CUMULATION).unwrap_or_default();
        cumulation.extend_from_slice(incoming.readable()?);
        while let Some(frame) = self.codec.decode(&mut cumulation)? {
            tracing::trace!(
                session = %ctx.session().id(),
                cmd = frame.cmd,
                flow = frame.flow,
                "fai frame decoded"
            );
            ctx.fire_read(Message::user(frame))?;
        }
        if !cumulation.is_empty() {
            attributes.insert(&CUMULATION, cumulation);
        }
        Ok(())
    }

    fn on_write(&self, ctx: &FilterContext<'_>, message: Message) -> Result<(), CoreError> {
        match message.downcast::<FaiFrame>() {
            Ok(frame) => {
                let encoded = self.codec.encode_to_bytes(&frame)?;
                ctx.write(Message::Buffer(ByteBuffer::wrap(encoded)))
            }
            Err(other) => ctx.write(other),
        }
    }

    fn on_close(&self, ctx: &FilterContext<'_>) {
        ctx.session().attributes().remove(&CUMULATION);
        ctx.fire_close();
    }
}
