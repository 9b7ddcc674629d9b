//! SOCKS5（RFC 1928）客户端报文与 RFC 1929 用户名/密码子协商。

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use fai_core::{CoreError, codes};

pub const VERSION: u8 = 0x05;
pub const AUTH_VERSION: u8 = 0x01;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// 协商失败原因。
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SocksError {
    #[error("unexpected protocol version {0}")]
    BadVersion(u8),
    #[error("proxy accepted none of the offered methods")]
    NoAcceptableMethod,
    #[error("proxy chose method {0} which was not offered")]
    UnexpectedMethod(u8),
    #[error("proxy rejected credentials (status {0})")]
    AuthFailed(u8),
    #[error("proxy refused connect: {reason} (reply {code})")]
    Rejected { code: u8, reason: &'static str },
    #[error("unsupported address type {0}")]
    BadAddressType(u8),
    #[error("{0} longer than 255 bytes")]
    FieldTooLong(&'static str),
}

impl From<SocksError> for CoreError {
    fn from(value: SocksError) -> Self {
        CoreError::new(codes::PROTOCOL_SOCKS, value.to_string())
    }
}

/// 代理要连接的目标。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl From<SocketAddr> for TargetAddr {
    fn from(value: SocketAddr) -> Self {
        TargetAddr::Ip(value)
    }
}

/// 用户名/密码凭据。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// 问候报文：`[5, n, methods...]`。
pub fn encode_greeting(with_credentials: bool, dst: &mut BytesMut) {
    if with_credentials {
        dst.put_slice(&[VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS]);
    } else {
        dst.put_slice(&[VERSION, 1, METHOD_NO_AUTH]);
    }
}

/// 解析方法选择应答 `[5, method]`；不足两字节返回 `None`。
pub fn decode_method(src: &mut BytesMut, offered_credentials: bool) -> Result<Option<u8>, SocksError> {
    if src.len() < 2 {
        return Ok(None);
    }
    let reply = src.split_to(2);
    if reply[0] != VERSION {
        return Err(SocksError::BadVersion(reply[0]));
    }
    match reply[1] {
        METHOD_NO_AUTH => Ok(Some(METHOD_NO_AUTH)),
        METHOD_USER_PASS if offered_credentials => Ok(Some(METHOD_USER_PASS)),
        METHOD_NONE_ACCEPTABLE => Err(SocksError::NoAcceptableMethod),
        other => Err(SocksError::UnexpectedMethod(other)),
    }
}

/// RFC 1929 认证请求：`[1, ulen, user, plen, pass]`。
pub fn encode_auth(credentials: &Credentials, dst: &mut BytesMut) -> Result<(), SocksError> {
    let user = u8::try_from(credentials.username.len())
        .map_err(|_| SocksError::FieldTooLong("username"))?;
    let pass = u8::try_from(credentials.password.len())
        .map_err(|_| SocksError::FieldTooLong("password"))?;
    dst.put_u8(AUTH_VERSION);
    dst.put_u8(user);
    dst.put_slice(credentials.username.as_bytes());
    dst.put_u8(pass);
    dst.put_slice(credentials.password.as_bytes());
    Ok(())
}

/// 认证应答 `[1, status]`，状态非零即失败。
pub fn decode_auth(src: &mut BytesMut) -> Result<Option<()>, SocksError> {
    if src.len() < 2 {
        return Ok(None);
    }
    let reply = src.split_to(2);
    if reply[0] != AUTH_VERSION {
        return Err(SocksError::BadVersion(reply[0]));
    }
    if reply[1] != 0 {
        return Err(SocksError::AuthFailed(reply[1]));
    }
    Ok(Some(()))
}

/// 连接请求：`[5, CONNECT, 0, atyp, addr, port]`。
pub fn encode_connect(target: &TargetAddr, dst: &mut BytesMut) -> Result<(), SocksError> {
    dst.put_slice(&[VERSION, CMD_CONNECT, 0x00]);
    match target {
        TargetAddr::Ip(SocketAddr::V4(addr)) => {
            dst.put_u8(ATYP_IPV4);
            dst.put_slice(&addr.ip().octets());
            dst.put_u16(addr.port());
        }
        TargetAddr::Ip(SocketAddr::V6(addr)) => {
            dst.put_u8(ATYP_IPV6);
            dst.put_slice(&addr.ip().octets());
            dst.put_u16(addr.port());
        }
        TargetAddr::Domain(host, port) => {
            let len = u8::try_from(host.len()).map_err(|_| SocksError::FieldTooLong("domain"))?;
            dst.put_u8(ATYP_DOMAIN);
            dst.put_u8(len);
            dst.put_slice(host.as_bytes());
            dst.put_u16(*port);
        }
    }
    Ok(())
}

/// 解析连接应答，返回代理侧绑定地址。
///
/// 应答长度取决于地址类型：IPv4 为 10 字节，IPv6 为 22 字节，域名为 `7 + len`。
pub fn decode_reply(src: &mut BytesMut) -> Result<Option<TargetAddr>, SocksError> {
    if src.len() < 5 {
        return Ok(None);
    }
    if src[0] != VERSION {
        return Err(SocksError::BadVersion(src[0]));
    }
    if src[1] != 0 {
        return Err(SocksError::Rejected {
            code: src[1],
            reason: reply_reason(src[1]),
        });
    }
    let total = match src[3] {
        ATYP_IPV4 => 10,
        ATYP_IPV6 => 22,
        ATYP_DOMAIN => 7 + usize::from(src[4]),
        other => return Err(SocksError::BadAddressType(other)),
    };
    if src.len() < total {
        return Ok(None);
    }
    let reply = src.split_to(total);
    let port = u16::from_be_bytes([reply[total - 2], reply[total - 1]]);
    let bound = match reply[3] {
        ATYP_IPV4 => {
            let octets: [u8; 4] = [reply[4], reply[5], reply[6], reply[7]];
            TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&reply[4..20]);
            TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => TargetAddr::Domain(
            String::from_utf8_lossy(&reply[5..total - 2]).into_owned(),
            port,
        ),
    };
    Ok(Some(bound))
}

fn reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unassigned reply code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_layouts() {
        let mut dst = BytesMut::new();
        encode_connect(&TargetAddr::Ip("10.0.0.1:80".parse().unwrap()), &mut dst).unwrap();
        assert_eq!(&dst[..], &[5, 1, 0, 1, 10, 0, 0, 1, 0, 80]);

        let mut dst = BytesMut::new();
        encode_connect(&TargetAddr::Domain("a.io".into(), 443), &mut dst).unwrap();
        assert_eq!(&dst[..], &[5, 1, 0, 3, 4, b'a', b'.', b'i', b'o', 1, 187]);
    }

    #[test]
    fn reply_length_depends_on_address_type() {
        let mut ipv6 = BytesMut::from(&[5u8, 0, 0, 4][..]);
        ipv6.extend_from_slice(&[0u8; 16]);
        ipv6.extend_from_slice(&[0x1f]);
        assert_eq!(decode_reply(&mut ipv6).unwrap(), None);
        ipv6.extend_from_slice(&[0x90, 0xAA]);
        let bound = decode_reply(&mut ipv6).unwrap().unwrap();
        assert_eq!(bound, TargetAddr::Ip("[::]:8080".parse().unwrap()));
        assert_eq!(&ipv6[..], &[0xAA]);

        let mut domain = BytesMut::from(&[5u8, 0, 0, 3, 2, b'p', b'x', 0, 1][..]);
        assert_eq!(
            decode_reply(&mut domain).unwrap(),
            Some(TargetAddr::Domain("px".into(), 1))
        );
    }

    #[test]
    fn refusals_are_reported() {
        let mut refused = BytesMut::from(&[5u8, 5, 0, 1, 0][..]);
        assert_eq!(
            decode_reply(&mut refused),
            Err(SocksError::Rejected {
                code: 5,
                reason: "connection refused"
            })
        );
        let mut none = BytesMut::from(&[5u8, 0xff][..]);
        assert_eq!(decode_method(&mut none, false), Err(SocksError::NoAcceptableMethod));
        let mut sneaky = BytesMut::from(&[5u8, 2][..]);
        assert_eq!(decode_method(&mut sneaky, false), Err(SocksError::UnexpectedMethod(2)));
    }
}
