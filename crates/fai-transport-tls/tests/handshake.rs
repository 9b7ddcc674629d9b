//! 两个内存会话之间的 TLS 握手：on_connect 延迟、扣留写出、ALPN/SNI 与证书校验失败。

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use fai_core::{
    CoreError, Message, Session, codes,
    pipeline::FilterChain,
    test_stubs::{RecordingHandler, RecordingSession},
};
use fai_transport_tls::{TlsError, TlsFilter};
use rustls::{
    ClientConfig, ProtocolVersion, RootCertStore, ServerConfig,
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
};

const HOST: &str = "fai.test";
const ALPN: &[u8] = b"fai/1";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn self_signed(host: &str) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![host.to_owned()]).context("self-signed cert")?;
    let cert = CertificateDer::from(cert.der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((cert, key))
}

fn server_config(cert: CertificateDer<'static>, key: PrivateKeyDer<'static>) -> Result<Arc<ServerConfig>> {
    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(Arc::new(config))
}

fn client_config(trusted: CertificateDer<'static>) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.add(trusted)?;
    let mut config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(Arc::new(config))
}

struct Pair {
    client: RecordingSession,
    client_handler: RecordingHandler,
    server: RecordingSession,
    server_handler: RecordingHandler,
}

/// 在两个会话之间来回搬运线路字节，直到双方都无字节可写。
fn pump(pair: &Pair) -> Result<(), CoreError> {
    for _ in 0..32 {
        let to_server = pair.client.take_wire();
        let to_client = pair.server.take_wire();
        if to_server.is_empty() && to_client.is_empty() {
            return Ok(());
        }
        if !to_server.is_empty() {
            pair.server.feed(&to_server)?;
        }
        if !to_client.is_empty() {
            pair.client.feed(&to_client)?;
        }
    }
    panic!("tls exchange did not settle");
}

fn plaintext(handler: &RecordingHandler) -> Vec<u8> {
    handler
        .take_reads()
        .into_iter()
        .flat_map(|message| message.into_buffer().unwrap().to_vec().unwrap())
        .collect()
}

/// 建立一对会话；`trusted` 为 `None` 时客户端信任服务端真实证书，否则只信任给定证书。
fn pair(server_handler: RecordingHandler, trusted: Option<CertificateDer<'static>>) -> Result<Pair> {
    let (cert, key) = self_signed(HOST)?;
    let trusted = trusted.unwrap_or_else(|| cert.clone());
    let client_handler = RecordingHandler::new();
    let client = RecordingSession::new(1);
    client.attach(
        FilterChain::builder(client_handler.clone())
            .add_last(TlsFilter::client(client_config(trusted)?, HOST)?)
            .build(),
    );
    let server = RecordingSession::new(2);
    server.attach(
        FilterChain::builder(server_handler.clone())
            .add_last(TlsFilter::server(server_config(cert, key)?))
            .build(),
    );
    Ok(Pair {
        client,
        client_handler,
        server,
        server_handler,
    })
}

#[test]
fn on_connect_is_deferred_until_the_handshake_completes() -> Result<()> {
    let pair = pair(RecordingHandler::echo(), None)?;
    pair.server.fire_connect()?;
    pair.client.fire_connect()?;
    assert_eq!(pair.client_handler.connects(), 0);
    assert_eq!(pair.server_handler.connects(), 0);
    assert!(!TlsFilter::is_established(&pair.client));

    pump(&pair)?;
    assert_eq!(pair.client_handler.connects(), 1);
    assert_eq!(pair.server_handler.connects(), 1);

    let client_side = TlsFilter::handshake(&pair.client).context("client handshake")?;
    assert_eq!(client_side.alpn.as_deref(), Some(ALPN));
    assert_eq!(client_side.protocol_version, Some(ProtocolVersion::TLSv1_3));
    let server_side = TlsFilter::handshake(&pair.server).context("server handshake")?;
    assert_eq!(server_side.server_name.as_deref(), Some(HOST));

    let sent = pair.client.write(Message::from("ping"));
    assert!(sent.try_get().is_some_and(|outcome| outcome.is_ok()));
    pump(&pair)?;
    assert_eq!(plaintext(&pair.client_handler), b"ping");
    Ok(())
}

#[test]
fn writes_issued_during_the_handshake_are_held() -> Result<()> {
    let pair = pair(RecordingHandler::new(), None)?;
    pair.server.fire_connect()?;
    pair.client.fire_connect()?;
    let hello = pair.client.take_wire();

    pair.client.write(Message::from("early|"));
    pair.client.write(Message::from("bird"));
    assert!(pair.client.take_wire().is_empty(), "plaintext must not leak before the handshake");

    pair.server.feed(&hello)?;
    pump(&pair)?;
    assert_eq!(plaintext(&pair.server_handler), b"early|bird");
    Ok(())
}

#[test]
fn large_payloads_are_sealed_in_batches() -> Result<()> {
    let pair = pair(RecordingHandler::echo(), None)?;
    pair.server.fire_connect()?;
    pair.client.fire_connect()?;
    pump(&pair)?;

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    pair.client.write(Message::from(payload.clone()));
    pump(&pair)?;
    assert_eq!(plaintext(&pair.client_handler), payload);
    Ok(())
}

#[test]
fn untrusted_certificate_fails_the_handshake() -> Result<()> {
    // 同一主机名、不同密钥的自签名证书。
    let (stranger, _) = self_signed(HOST)?;
    let pair = pair(RecordingHandler::new(), Some(stranger))?;
    pair.server.fire_connect()?;
    pair.client.fire_connect()?;

    let Err(err) = pump(&pair) else {
        bail!("handshake with an untrusted certificate must fail");
    };
    assert_eq!(err.code(), codes::PROTOCOL_TLS);
    assert_eq!(pair.client_handler.connects(), 0);
    let errors = pair.client_handler.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code(), codes::PROTOCOL_TLS);
    assert_eq!(pair.client_handler.closes(), 1);
    assert_eq!(pair.server_handler.connects(), 0);
    Ok(())
}

#[test]
fn invalid_server_name_is_rejected_up_front() -> Result<()> {
    let (cert, _) = self_signed(HOST)?;
    let outcome = TlsFilter::client(client_config(cert)?, "not a host name");
    assert!(matches!(outcome, Err(TlsError::InvalidServerName(_))));
    Ok(())
}
