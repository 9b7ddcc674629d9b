use std::sync::Arc;

use bytes::BytesMut;
use fai_core::{
    CoreError, Message,
    attribute::AttributeKey,
    buffer::ByteBuffer,
    pipeline::{Filter, FilterContext},
};

use super::protocol::{
    self, Credentials, METHOD_USER_PASS, TargetAddr, decode_auth, decode_method, decode_reply,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Greeting,
    Auth,
    Connect,
}

struct Negotiation {
    phase: Phase,
    cumulation: BytesMut,
    held: Vec<Message>,
}

impl Negotiation {
    fn new() -> Self {
        Self {
            phase: Phase::Greeting,
            cumulation: BytesMut::new(),
            held: Vec::new(),
        }
    }
}

const NEGOTIATION: AttributeKey<Negotiation> = AttributeKey::new("socks5.negotiation");
const ESTABLISHED: AttributeKey<TargetAddr> = AttributeKey::new("socks5.established");

/// SOCKS5 客户端协商过滤器，放在链首，使其上的所有过滤器都运行在隧道之内。
///
/// # 执行逻辑（How）
/// 1. `on_connect` 不向上转发，而是发送问候报文；
/// 2. 收到方法选择后按需发送 RFC 1929 认证，再发送 CONNECT 请求；
/// 3. CONNECT 应答成功：先按顺序下发协商期间被扣留的写出，再向上转发 `on_connect`，
///    最后把应答之后同批到达的字节作为普通读事件上送；
/// 4. 任何拒绝或格式错误返回 `protocol.socks`，连接随之关闭。
///
/// # 契约说明（What）
/// - 隧道建立前上层发出的写出被扣留而非丢弃，其完成信号在交给本过滤器时即视为受理；
/// - 建立后本过滤器对读写完全透明，代理侧绑定地址可通过 [`Socks5ConnectFilter::bound_addr`] 查询。
#[derive(Clone, Debug)]
pub struct Socks5ConnectFilter {
    target: Arc<TargetAddr>,
    credentials: Option<Arc<Credentials>>,
}

impl Socks5ConnectFilter {
    pub fn new(target: impl Into<TargetAddr>) -> Self {
        Self {
            target: Arc::new(target.into()),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Arc::new(Credentials {
            username: username.into(),
            password: password.into(),
        }));
        self
    }

    /// 隧道建立后代理报告的绑定地址。
    pub fn bound_addr(session: &dyn fai_core::Session) -> Option<TargetAddr> {
        session.attributes().get(&ESTABLISHED)
    }

    fn send(ctx: &FilterContext<'_>, bytes: BytesMut) -> Result<(), CoreError> {
        ctx.write(Message::Buffer(ByteBuffer::wrap(bytes.freeze())))
    }

    fn send_connect(&self, ctx: &FilterContext<'_>) -> Result<(), CoreError> {
        let mut request = BytesMut::new();
        protocol::encode_connect(&self.target, &mut request)?;
        Self::send(ctx, request)
    }

    fn establish(
        &self,
        ctx: &FilterContext<'_>,
        bound: TargetAddr,
        state: Negotiation,
    ) -> Result<(), CoreError> {
        let session = ctx.session();
        tracing::debug!(session = %session.id(), bound = ?bound, "socks5 tunnel established");
        session.attributes().insert(&ESTABLISHED, bound);
        for held in state.held {
            ctx.write(held)?;
        }
        ctx.fire_connect()?;
        if !state.cumulation.is_empty() {
            ctx.fire_read(Message::Buffer(ByteBuffer::wrap(state.cumulation.freeze())))?;
        }
        Ok(())
    }
}

impl Filter for Socks5ConnectFilter {
    fn name(&self) -> &'static str {
        "socks5-connect"
    }

    fn on_connect(&self, ctx: &FilterContext<'_>) -> Result<(), CoreError> {
        let attributes = ctx.session().attributes();
        let mut state = attributes.take(&NEGOTIATION).unwrap_or_else(Negotiation::new);
        state.phase = Phase::Greeting;
        attributes.insert(&NEGOTIATION, state);
        let mut greeting = BytesMut::new();
        protocol::encode_greeting(self.credentials.is_some(), &mut greeting);
        Self::send(ctx, greeting)
    }

    fn on_read(&self, ctx: &FilterContext<'_>, message: Message) -> Result<(), CoreError> {
        let attributes = ctx.session().attributes();
        if attributes.contains(&ESTABLISHED) {
            return ctx.fire_read(message);
        }
        let incoming = message.into_buffer()?;
        let mut state = attributes.take(&NEGOTIATION).unwrap_or_else(Negotiation::new);
        state.cumulation.extend_from_slice(incoming.readable()?);
        loop {
            match state.phase {
                Phase::Greeting => {
                    let Some(method) =
                        decode_method(&mut state.cumulation, self.credentials.is_some())?
                    else {
                        break;
                    };
                    match (&self.credentials, method) {
                        (Some(credentials), METHOD_USER_PASS) => {
                            let mut auth = BytesMut::new();
                            protocol::encode_auth(credentials, &mut auth)?;
                            Self::send(ctx, auth)?;
                            state.phase = Phase::Auth;
                        }
                        _ => {
                            self.send_connect(ctx)?;
                            state.phase = Phase::Connect;
                        }
                    }
                }
                Phase::Auth => {
                    if decode_auth(&mut state.cumulation)?.is_none() {
                        break;
                    }
                    self.send_connect(ctx)?;
                    state.phase = Phase::Connect;
                }
                Phase::Connect => {
                    let Some(bound) = decode_reply(&mut state.cumulation)? else {
                        break;
                    };
                    return self.establish(ctx, bound, state);
                }
            }
        }
        attributes.insert(&NEGOTIATION, state);
        Ok(())
    }

    fn on_write(&self, ctx: &FilterContext<'_>, message: Message) -> Result<(), CoreError> {
        let attributes = ctx.session().attributes();
        if attributes.contains(&ESTABLISHED) {
            return ctx.write(message);
        }
        let mut message = Some(message);
        attributes.with_mut(&NEGOTIATION, |state| {
            if let Some(message) = message.take() {
                state.held.push(message);
            }
        });
        if let Some(message) = message {
            let mut state = Negotiation::new();
            state.held.push(message);
            attributes.insert(&NEGOTIATION, state);
        }
        Ok(())
    }

    fn on_close(&self, ctx: &FilterContext<'_>) {
        let attributes = ctx.session().attributes();
        attributes.remove(&NEGOTIATION);
        attributes.remove(&ESTABLISHED);
        ctx.fire_close();
    }
}
