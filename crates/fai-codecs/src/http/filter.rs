use bytes::BytesMut;
use fai_core::{
    CoreError, Message,
    attribute::AttributeKey,
    buffer::ByteBuffer,
    pipeline::{Filter, FilterContext},
};

use super::{
    message::HttpRequest,
    parser::{HttpLimits, ResponseDecoder},
};

struct ClientState {
    decoder: ResponseDecoder,
    cumulation: BytesMut,
}

const STATE: AttributeKey<ClientState> = AttributeKey::new("http.client");

/// HTTP/1.1 客户端编解码过滤器。
///
/// # 契约说明（What）
/// - 出站：[`HttpRequest`] 编码为字节，同时按发送顺序登记方法，使流水线上的 `HEAD` 响应不读消息体；
/// - 入站：字节累积到完整响应后，以 `Message::user(HttpResponse)` 转发；
/// - 本次读事件解出的全部响应在状态放回属性表之后才依次转发，
///   业务在回调中继续发请求不会丢失方法登记。
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpClientFilter {
    limits: HttpLimits,
}

impl HttpClientFilter {
    pub fn new(limits: HttpLimits) -> Self {
        Self { limits }
    }

    fn state(&self, ctx: &FilterContext<'_>) -> ClientState {
        ctx.session()
            .attributes()
            .take(&STATE)
            .unwrap_or_else(|| ClientState {
                decoder: ResponseDecoder::new(self.limits),
                cumulation: BytesMut::new(),
            })
    }
}

impl Filter for HttpClientFilter {
    fn name(&self) -> &'static str {
        "http-client"
    }

    fn on_read(&self, ctx: &FilterContext<'_>, message: Message) -> Result<(), CoreError> {
        let incoming = message.into_buffer()?;
        let mut state = self.state(ctx);
        state.cumulation.extend_from_slice(incoming.readable()?);
        let mut responses = Vec::new();
        while let Some(response) = state.decoder.decode(&mut state.cumulation)? {
            responses.push(response);
        }
        ctx.session().attributes().insert(&STATE, state);
        for response in responses {
            tracing::trace!(
                session = %ctx.session().id(),
                status = response.status,
                "http response decoded"
            );
            ctx.fire_read(Message::user(response))?;
        }
        Ok(())
    }

    fn on_write(&self, ctx: &FilterContext<'_>, message: Message) -> Result<(), CoreError> {
        let request = match message.downcast::<HttpRequest>() {
            Ok(request) => request,
            Err(other) => return ctx.write(other),
        };
        let attributes = ctx.session().attributes();
        let registered = attributes.with_mut(&STATE, |state| {
            state.decoder.expect_response(request.is_head())
        });
        if registered.is_none() {
            let mut state = self.state(ctx);
            state.decoder.expect_response(request.is_head());
            attributes.insert(&STATE, state);
        }
        ctx.write(Message::Buffer(ByteBuffer::wrap(request.to_bytes())))
    }

    fn on_close(&self, ctx: &FilterContext<'_>) {
        ctx.session().attributes().remove(&STATE);
        ctx.fire_close();
    }
}
