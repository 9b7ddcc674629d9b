//! FAI 二进制成帧协议：32 字节定长头 + 可选扩展 + 消息体，全部字段为网络字节序。

mod filter;
mod frame;
mod header;

pub use filter::FaiFrameFilter;
pub use frame::{FaiCodec, FaiFrame};
pub use header::{
    FLAG_KEEP_ALIVE, FLAG_SEND_ONLY, FaiError, FaiHeader, HEADER_LEN, MAGIC, VERSION, checksum,
};
