//! HTTP/1.1 响应增量解析。
//!
//! # 执行逻辑（How）
//! - 头部：在累积缓冲中查找 `\r\n\r\n`，找到后一次性解析状态行与头部；
//! - 消息体：请求为 `HEAD`、状态为 1xx/204/304 时无体；`Transfer-Encoding: chunked` 走分块；
//!   否则按 `Content-Length` 定长读取；两者都缺失时视为空体；
//! - 分块：`<hex>[;ext]\r\n<data>\r\n` 重复，直到零长度块，随后读取 trailer 直至空行。
//!
//! # 契约说明（What）
//! - 字节不足时返回 `Ok(None)`，已确认的进度保存在解码器内部，重复投递不会重复解析；
//! - 头部（含 trailer 单行）超过预算、长度字段非法、分块格式错误均返回 [`HttpError`]。

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};
use fai_core::{CoreError, codes};

use super::message::{Headers, HttpResponse};

const CRLF: &[u8] = b"\r\n";
const HEAD_END: &[u8] = b"\r\n\r\n";

/// 响应解析失败原因。
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    #[error("response head exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },
    #[error("response body of {length} bytes exceeds {limit}")]
    BodyTooLarge { length: usize, limit: usize },
    #[error("response head is not valid UTF-8")]
    NotUtf8,
    #[error("malformed status line `{0}`")]
    MalformedStatusLine(String),
    #[error("malformed header line `{0}`")]
    MalformedHeader(String),
    #[error("invalid Content-Length `{0}`")]
    InvalidContentLength(String),
    #[error("invalid chunk size `{0}`")]
    InvalidChunkSize(String),
    #[error("chunk data is not terminated by CRLF")]
    MissingChunkDelimiter,
}

impl From<HttpError> for CoreError {
    fn from(value: HttpError) -> Self {
        CoreError::new(codes::PROTOCOL_HTTP, value.to_string())
    }
}

/// 解析预算。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HttpLimits {
    pub max_header_size: usize,
    pub max_body_size: usize,
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            max_header_size: 8 * 1024,
            max_body_size: 8 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Chunk {
    Size,
    Data(usize),
    Trailers,
}

#[derive(Debug)]
enum Phase {
    Head,
    Fixed {
        response: HttpResponse,
        length: usize,
    },
    Chunked {
        response: HttpResponse,
        body: BytesMut,
        chunk: Chunk,
    },
}

enum Body {
    None,
    Fixed(usize),
    Chunked,
}

/// 单条连接上的响应解码器，按发送顺序记录尚未收到最终响应的请求是否为 `HEAD`。
#[derive(Debug)]
pub struct ResponseDecoder {
    limits: HttpLimits,
    phase: Phase,
    pending_heads: VecDeque<bool>,
}

impl ResponseDecoder {
    pub fn new(limits: HttpLimits) -> Self {
        Self {
            limits,
            phase: Phase::Head,
            pending_heads: VecDeque::new(),
        }
    }

    /// 登记一个已发出的请求；`is_head` 决定对应响应是否携带消息体。
    pub fn expect_response(&mut self, is_head: bool) {
        self.pending_heads.push_back(is_head);
    }

    /// 已发出但尚未收到最终响应的请求数。
    pub fn outstanding(&self) -> usize {
        self.pending_heads.len()
    }

    /// 尝试从 `src` 解出一条完整响应，已消费的字节从 `src` 移除。
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<HttpResponse>, HttpError> {
        if let Phase::Head = self.phase {
            let Some(response) = self.decode_head(src)? else {
                return Ok(None);
            };
            match self.body_of(&response)? {
                Body::None => return Ok(Some(response)),
                Body::Fixed(length) => self.phase = Phase::Fixed { response, length },
                Body::Chunked => {
                    self.phase = Phase::Chunked {
                        response,
                        body: BytesMut::new(),
                        chunk: Chunk::Size,
                    }
                }
            }
        }
        match std::mem::replace(&mut self.phase, Phase::Head) {
            Phase::Head => Ok(None),
            Phase::Fixed { response, length } => {
                if src.len() < length {
                    self.phase = Phase::Fixed { response, length };
                    return Ok(None);
                }
                let body = src.split_to(length).freeze();
                Ok(Some(HttpResponse { body, ..response }))
            }
            Phase::Chunked {
                mut response,
                mut body,
                mut chunk,
            } => {
                if self.advance_chunked(src, &mut body, &mut chunk, &mut response.trailers)? {
                    return Ok(Some(HttpResponse {
                        body: body.freeze(),
                        ..response
                    }));
                }
                self.phase = Phase::Chunked {
                    response,
                    body,
                    chunk,
                };
                Ok(None)
            }
        }
    }

    fn decode_head(&self, src: &mut BytesMut) -> Result<Option<HttpResponse>, HttpError> {
        let limit = self.limits.max_header_size;
        let Some(end) = find(src, HEAD_END) else {
            if src.len() > limit {
                return Err(HttpError::HeaderTooLarge { limit });
            }
            return Ok(None);
        };
        if end + HEAD_END.len() > limit {
            return Err(HttpError::HeaderTooLarge { limit });
        }
        let head = src.split_to(end + HEAD_END.len());
        parse_head(&head[..end]).map(Some)
    }

    fn body_of(&mut self, response: &HttpResponse) -> Result<Body, HttpError> {
        let interim = response.is_interim();
        let head_request = !interim && self.pending_heads.pop_front().unwrap_or(false);
        if head_request || interim || response.status == 204 || response.status == 304 {
            return Ok(Body::None);
        }
        let chunked = response
            .header("transfer-encoding")
            .and_then(|value| value.rsplit(',').next())
            .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
        if chunked {
            return Ok(Body::Chunked);
        }
        let length = match response.header("content-length") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| HttpError::InvalidContentLength(raw.to_owned()))?,
            None => 0,
        };
        if length > self.limits.max_body_size {
            return Err(HttpError::BodyTooLarge {
                length,
                limit: self.limits.max_body_size,
            });
        }
        Ok(if length == 0 {
            Body::None
        } else {
            Body::Fixed(length)
        })
    }

    fn advance_chunked(
        &self,
        src: &mut BytesMut,
        body: &mut BytesMut,
        chunk: &mut Chunk,
        trailers: &mut Headers,
    ) -> Result<bool, HttpError> {
        loop {
            match *chunk {
                Chunk::Size => {
                    let Some(line) = self.take_line(src)? else {
                        return Ok(false);
                    };
                    let text = std::str::from_utf8(&line).map_err(|_| HttpError::NotUtf8)?;
                    let digits = text.split(';').next().unwrap_or_default().trim();
                    let size = usize::from_str_radix(digits, 16)
                        .map_err(|_| HttpError::InvalidChunkSize(text.to_owned()))?;
                    let total = body.len().saturating_add(size);
                    if total > self.limits.max_body_size {
                        return Err(HttpError::BodyTooLarge {
                            length: total,
                            limit: self.limits.max_body_size,
                        });
                    }
                    *chunk = if size == 0 {
                        Chunk::Trailers
                    } else {
                        Chunk::Data(size)
                    };
                }
                Chunk::Data(size) => {
                    if src.len() < size + CRLF.len() {
                        return Ok(false);
                    }
                    body.extend_from_slice(&src[..size]);
                    src.advance(size);
                    if &src[..CRLF.len()] != CRLF {
                        return Err(HttpError::MissingChunkDelimiter);
                    }
                    src.advance(CRLF.len());
                    *chunk = Chunk::Size;
                }
                Chunk::Trailers => {
                    let Some(line) = self.take_line(src)? else {
                        return Ok(false);
                    };
                    if line.is_empty() {
                        return Ok(true);
                    }
                    let text = std::str::from_utf8(&line).map_err(|_| HttpError::NotUtf8)?;
                    trailers.push(parse_header_line(text)?);
                }
            }
        }
    }

    /// 取出一行（不含 CRLF）；单行长度受头部预算约束。
    fn take_line(&self, src: &mut BytesMut) -> Result<Option<Bytes>, HttpError> {
        let limit = self.limits.max_header_size;
        match find(src, CRLF) {
            Some(end) => {
                let mut line = src.split_to(end + CRLF.len()).freeze();
                line.truncate(end);
                Ok(Some(line))
            }
            None if src.len() > limit => Err(HttpError::HeaderTooLarge { limit }),
            None => Ok(None),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_head(raw: &[u8]) -> Result<HttpResponse, HttpError> {
    let text = std::str::from_utf8(raw).map_err(|_| HttpError::NotUtf8)?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..1000).contains(code));
    let (true, Some(status)) = (version.starts_with("HTTP/"), status) else {
        return Err(HttpError::MalformedStatusLine(status_line.to_owned()));
    };
    let reason = parts.next().unwrap_or_default().trim().to_owned();
    let headers = lines
        .filter(|line| !line.is_empty())
        .map(parse_header_line)
        .collect::<Result<Headers, _>>()?;
    Ok(HttpResponse {
        version: version.to_owned(),
        status,
        reason,
        headers,
        body: Bytes::new(),
        trailers: Vec::new(),
    })
}

fn parse_header_line(line: &str) -> Result<(String, String), HttpError> {
    match line.split_once(':') {
        Some((name, value))
            if !name.is_empty() && !name.contains(|c: char| c.is_ascii_whitespace()) =>
        {
            Ok((name.to_owned(), value.trim().to_owned()))
        }
        _ => Err(HttpError::MalformedHeader(line.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut ResponseDecoder, wire: &[u8]) -> Vec<HttpResponse> {
        let mut src = BytesMut::from(wire);
        let mut out = Vec::new();
        while let Some(response) = decoder.decode(&mut src).unwrap() {
            out.push(response);
        }
        out
    }

    #[test]
    fn content_length_body() {
        let mut decoder = ResponseDecoder::new(HttpLimits::default());
        let out = decode_all(
            &mut decoder,
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-A: b\r\n\r\nhello",
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].status, 200);
        assert_eq!(out[0].reason, "OK");
        assert_eq!(out[0].header("x-a"), Some("b"));
        assert_eq!(&out[0].body[..], b"hello");
    }

    #[test]
    fn chunked_body_with_extensions_and_trailers() {
        let mut decoder = ResponseDecoder::new(HttpLimits::default());
        let out = decode_all(
            &mut decoder,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\n\r\n\
              4;name=v\r\nWiki\r\n5\r\npedia\r\n0\r\nExpires: never\r\n\r\n",
        );
        assert_eq!(&out[0].body[..], b"Wikipedia");
        assert_eq!(out[0].trailers, vec![("Expires".to_owned(), "never".to_owned())]);
    }

    #[test]
    fn head_and_no_content_responses_have_no_body() {
        let mut decoder = ResponseDecoder::new(HttpLimits::default());
        decoder.expect_response(true);
        decoder.expect_response(false);
        let out = decode_all(
            &mut decoder,
            b"HTTP/1.1 200 OK\r\nContent-Length: 99\r\n\r\n\
              HTTP/1.1 304 Not Modified\r\nContent-Length: 7\r\n\r\n",
        );
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|response| response.body.is_empty()));
        assert_eq!(decoder.outstanding(), 0);
    }

    #[test]
    fn interim_responses_do_not_consume_a_request() {
        let mut decoder = ResponseDecoder::new(HttpLimits::default());
        decoder.expect_response(false);
        let out = decode_all(
            &mut decoder,
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        );
        assert_eq!(out.len(), 2);
        assert!(out[0].is_interim());
        assert_eq!(&out[1].body[..], b"ok");
    }

    #[test]
    fn malformed_input_is_rejected() {
        let mut decoder = ResponseDecoder::new(HttpLimits::default());
        let mut src = BytesMut::from(&b"SPDY/3 200 OK\r\n\r\n"[..]);
        assert!(matches!(decoder.decode(&mut src), Err(HttpError::MalformedStatusLine(_))));

        let mut decoder = ResponseDecoder::new(HttpLimits::default());
        let mut src = BytesMut::from(&b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n"[..]);
        assert!(matches!(decoder.decode(&mut src), Err(HttpError::InvalidChunkSize(_))));
    }

    #[test]
    fn header_budget_is_enforced_before_terminator_arrives() {
        let mut decoder = ResponseDecoder::new(HttpLimits {
            max_header_size: 16,
            max_body_size: 16,
        });
        let mut src = BytesMut::from(&b"HTTP/1.1 200 OK\r\nX-Long: aaaaaaa"[..]);
        assert_eq!(
            decoder.decode(&mut src),
            Err(HttpError::HeaderTooLarge { limit: 16 })
        );
    }
}
