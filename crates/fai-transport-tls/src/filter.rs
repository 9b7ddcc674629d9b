use std::{
    fmt,
    io::{Read, Write},
    sync::Arc,
};

use fai_core::{
    CoreError, Message, Session,
    attribute::AttributeKey,
    buffer::ByteBuffer,
    pipeline::{Filter, FilterContext},
};
use rustls::{
    ClientConfig, ClientConnection, Connection, ProtocolVersion, ServerConfig, ServerConnection,
    pki_types::ServerName,
};

use crate::error::TlsError;

const SESSION: AttributeKey<Connection> = AttributeKey::new("tls.session");
const HELD: AttributeKey<Vec<Message>> = AttributeKey::new("tls.held");
const HANDSHAKE: AttributeKey<Handshake> = AttributeKey::new("tls.handshake");

/// 握手完成时协商出的参数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    /// 双方协商出的 ALPN 协议；任一方未配置 ALPN 时为 `None`。
    pub alpn: Option<Vec<u8>>,
    /// 服务端模式下客户端在 SNI 中请求的主机名。
    pub server_name: Option<String>,
    pub protocol_version: Option<ProtocolVersion>,
}

impl Handshake {
    fn capture(conn: &Connection) -> Self {
        let server_name = match conn {
            Connection::Server(server) => server.server_name().map(str::to_owned),
            Connection::Client(_) => None,
        };
        Self {
            alpn: conn.alpn_protocol().map(<[u8]>::to_vec),
            server_name,
            protocol_version: conn.protocol_version(),
        }
    }
}

enum Mode {
    Client {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    },
    Server {
        config: Arc<ServerConfig>,
    },
}

/// TLS 协商过滤器。
///
/// # 设计背景（Why）
/// - 加密层只是链上的一站：它下面的过滤器（例如 SOCKS5 隧道）看到的是密文记录，
///   它上面的过滤器与业务处理器看到的是明文，套接字与反应器对 TLS 一无所知；
/// - rustls 的缓冲式连接不做任何 IO，只在字节切片之间搬运，正好适配“收到一段字节、写出一段字节”的过滤器模型。
///
/// # 契约说明（What）
/// - `on_connect` 不立即上送：客户端模式先写出 ClientHello，握手完成后才向上转发 `on_connect`；
/// - 握手完成前上层发出的明文写出被扣留，完成后按原顺序加密写出，随后才转发 `on_connect`；
/// - 握手失败（含证书校验失败）时先写出 rustls 排队的告警，再返回 `protocol.tls`，连接随之关闭；
/// - 收到对端的 `close_notify` 后先上送同批明文，再请求关闭连接；
/// - 协商结果可通过 [`TlsFilter::handshake`] 查询。
///
/// # 风险提示（Trade-offs）
/// - 应用侧关闭不发送 `close_notify`，对端只会看到 TCP 层的 EOF。
///
/// 过滤器本身可以在连接间共享，每条连接的 rustls 状态保存在会话属性表中。
#[derive(Clone)]
pub struct TlsFilter {
    mode: Arc<Mode>,
}

impl TlsFilter {
    /// 客户端模式：以 `server_name` 作为 SNI 并校验服务端证书。
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, TlsError> {
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_owned()))?;
        Ok(Self {
            mode: Arc::new(Mode::Client {
                config,
                server_name,
            }),
        })
    }

    /// 服务端模式。
    pub fn server(config: Arc<ServerConfig>) -> Self {
        Self {
            mode: Arc::new(Mode::Server { config }),
        }
    }

    /// 握手完成后的协商结果；握手未完成时为 `None`。
    pub fn handshake(session: &dyn Session) -> Option<Handshake> {
        session.attributes().get(&HANDSHAKE)
    }

    pub fn is_established(session: &dyn Session) -> bool {
        session.attributes().contains(&HANDSHAKE)
    }

    fn open(&self) -> Result<Connection, TlsError> {
        Ok(match self.mode.as_ref() {
            Mode::Client {
                config,
                server_name,
            } => ClientConnection::new(Arc::clone(config), server_name.clone())?.into(),
            Mode::Server { config } => ServerConnection::new(Arc::clone(config))?.into(),
        })
    }

    fn mode_name(&self) -> &'static str {
        match self.mode.as_ref() {
            Mode::Client { .. } => "client",
            Mode::Server { .. } => "server",
        }
    }

    /// 加密一条明文写出并交给下一站。
    fn seal(ctx: &FilterContext<'_>, message: Message) -> Result<(), CoreError> {
        let plaintext = message.into_buffer()?;
        let bytes = plaintext.readable()?;
        let sealed = ctx
            .session()
            .attributes()
            .with_mut(&SESSION, |conn| -> Result<Vec<u8>, TlsError> {
                let mut wire = Vec::new();
                let mut rest = bytes;
                // rustls 的发送缓冲有上限，大块明文分批接收，每批之后立即取走密文。
                while !rest.is_empty() {
                    let accepted = conn.writer().write(rest)?;
                    rest = &rest[accepted..];
                    drain_records(conn, &mut wire)?;
                }
                Ok(wire)
            })
            .ok_or(TlsError::MissingSession)??;
        send(ctx, sealed)
    }

    fn establish(&self, ctx: &FilterContext<'_>, handshake: Handshake) -> Result<(), CoreError> {
        let session = ctx.session();
        tracing::debug!(
            session = %session.id(),
            mode = self.mode_name(),
            alpn = ?handshake.alpn.as_deref().map(String::from_utf8_lossy),
            version = ?handshake.protocol_version,
            "tls handshake completed"
        );
        let attributes = session.attributes();
        attributes.insert(&HANDSHAKE, handshake);
        for held in attributes.take(&HELD).unwrap_or_default() {
            Self::seal(ctx, held)?;
        }
        ctx.fire_connect()
    }
}

impl fmt::Debug for TlsFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsFilter")
            .field("mode", &self.mode_name())
            .finish_non_exhaustive()
    }
}

impl Filter for TlsFilter {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn on_connect(&self, ctx: &FilterContext<'_>) -> Result<(), CoreError> {
        let mut conn = self.open()?;
        let mut wire = Vec::new();
        drain_records(&mut conn, &mut wire)?;
        let session = ctx.session();
        session.attributes().insert(&SESSION, conn);
        tracing::debug!(session = %session.id(), mode = self.mode_name(), "tls handshake started");
        send(ctx, wire)
    }

    fn on_read(&self, ctx: &FilterContext<'_>, message: Message) -> Result<(), CoreError> {
        let incoming = message.into_buffer()?;
        let attributes = ctx.session().attributes();
        let mut conn = attributes.take(&SESSION).ok_or(TlsError::MissingSession)?;

        let was_handshaking = conn.is_handshaking();
        let mut plaintext = Vec::new();
        let absorbed = absorb(&mut conn, incoming.readable()?, &mut plaintext);
        // 协商失败时 rustls 已排好告警记录，先取出再报告错误。
        let mut wire = Vec::new();
        let drained = drain_records(&mut conn, &mut wire);
        let completed = (absorbed.is_ok() && was_handshaking && !conn.is_handshaking())
            .then(|| Handshake::capture(&conn));
        attributes.insert(&SESSION, conn);

        send(ctx, wire)?;
        let peer_closed = absorbed?;
        drained?;
        if let Some(handshake) = completed {
            self.establish(ctx, handshake)?;
        }
        if !plaintext.is_empty() {
            ctx.fire_read(Message::Buffer(ByteBuffer::wrap(plaintext)))?;
        }
        if peer_closed {
            tracing::debug!(session = %ctx.session().id(), "tls close_notify received");
            ctx.session().close();
        }
        Ok(())
    }

    fn on_write(&self, ctx: &FilterContext<'_>, message: Message) -> Result<(), CoreError> {
        let attributes = ctx.session().attributes();
        if attributes.contains(&HANDSHAKE) {
            return Self::seal(ctx, message);
        }
        let mut message = Some(message);
        attributes.with_mut(&HELD, |held| {
            if let Some(message) = message.take() {
                held.push(message);
            }
        });
        if let Some(message) = message {
            attributes.insert(&HELD, vec![message]);
        }
        Ok(())
    }

    fn on_close(&self, ctx: &FilterContext<'_>) {
        let attributes = ctx.session().attributes();
        attributes.remove(&SESSION);
        attributes.remove(&HELD);
        attributes.remove(&HANDSHAKE);
        ctx.fire_close();
    }
}

/// 把一段密文交给 rustls，取出全部解密后的明文；返回对端是否已发送 `close_notify`。
fn absorb(conn: &mut Connection, mut input: &[u8], plaintext: &mut Vec<u8>) -> Result<bool, TlsError> {
    let mut peer_closed = false;
    while !input.is_empty() {
        conn.read_tls(&mut input)?;
        let state = conn.process_new_packets()?;
        let available = state.plaintext_bytes_to_read();
        if available > 0 {
            let start = plaintext.len();
            plaintext.resize(start + available, 0);
            conn.reader().read_exact(&mut plaintext[start..])?;
        }
        peer_closed |= state.peer_has_closed();
    }
    Ok(peer_closed)
}

fn drain_records(conn: &mut Connection, wire: &mut Vec<u8>) -> Result<(), TlsError> {
    while conn.wants_write() {
        conn.write_tls(wire)?;
    }
    Ok(())
}

fn send(ctx: &FilterContext<'_>, wire: Vec<u8>) -> Result<(), CoreError> {
    if wire.is_empty() {
        return Ok(());
    }
    ctx.write(Message::Buffer(ByteBuffer::wrap(wire)))
}
