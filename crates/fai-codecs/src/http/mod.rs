//! HTTP/1.1 客户端编解码：请求编码、响应增量解析与流水线方法跟踪。

mod filter;
mod message;
mod parser;

pub use filter::HttpClientFilter;
pub use message::{Headers, HttpRequest, HttpResponse};
pub use parser::{HttpError, HttpLimits, ResponseDecoder};
