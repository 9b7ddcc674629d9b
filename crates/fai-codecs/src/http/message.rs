use bytes::{BufMut, Bytes, BytesMut};

/// 大小写不敏感的头部列表，保留原始顺序与大小写。
pub type Headers = Vec<(String, String)>;

fn find<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// 客户端请求。
///
/// ```rust
/// use fai_codecs::http::HttpRequest;
///
/// let request = HttpRequest::post("/v1/echo", "hi").header("Host", "example.test");
/// let wire = request.to_bytes();
/// assert!(wire.starts_with(b"POST /v1/echo HTTP/1.1\r\n"));
/// assert!(std::str::from_utf8(&wire).unwrap().contains("Content-Length: 2\r\n"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRequest {
    method: String,
    target: String,
    headers: Headers,
    body: Bytes,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new("GET", target)
    }

    pub fn head(target: impl Into<String>) -> Self {
        Self::new("HEAD", target)
    }

    pub fn post(target: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new("POST", target).body(body)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }

    fn needs_length(&self) -> bool {
        if find(&self.headers, "content-length").is_some()
            || find(&self.headers, "transfer-encoding").is_some()
        {
            return false;
        }
        !self.body.is_empty()
            || ["POST", "PUT", "PATCH"]
                .iter()
                .any(|method| self.method.eq_ignore_ascii_case(method))
    }

    /// 编码为 HTTP/1.1 报文；未声明长度时自动补 `Content-Length`。
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(self.method.as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.target.as_bytes());
        dst.put_slice(b" HTTP/1.1\r\n");
        for (name, value) in &self.headers {
            dst.put_slice(name.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }
        if self.needs_length() {
            dst.put_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        dst.put_slice(b"\r\n");
        dst.put_slice(&self.body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(64 + self.body.len());
        self.encode(&mut dst);
        dst.freeze()
    }
}

/// 解析完成的响应。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
    /// 分块编码末尾的 trailer 头。
    pub trailers: Headers,
}

impl HttpResponse {
    /// 按名称（大小写不敏感）查找首个头部值。
    pub fn header(&self, name: &str) -> Option<&str> {
        find(&self.headers, name)
    }

    /// 1xx 中间响应（`101` 除外），不对应任何请求的最终结果。
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }
}
