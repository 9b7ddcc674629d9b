use fai_core::{CoreError, codes};

/// 固定头长度。
pub const HEADER_LEN: usize = 32;
/// 魔数，校验成帧起点。
pub const MAGIC: u16 = 0x1122;
/// 当前协议版本。
pub const VERSION: u8 = 1;

const CHECKSUM_OFFSET: usize = 8;
const RESERVED: std::ops::Range<usize> = 26..32;

/// `flag` 字段：长连接，响应后不关闭。
pub const FLAG_KEEP_ALIVE: u16 = 0x0001;
/// `flag` 字段：单向发送，不期待响应。
pub const FLAG_SEND_ONLY: u16 = 0x0002;

/// 成帧失败原因。
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FaiError {
    #[error("bad magic 0x{0:04x}")]
    BadMagic(u16),
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("checksum mismatch: header carries {carried}, computed {computed}")]
    BadChecksum { carried: i16, computed: i16 },
    #[error("reserved header bytes must be zero")]
    ReservedNotZero,
    #[error("negative body length {0}")]
    NegativeLength(i32),
    #[error("frame length {length} exceeds limit {limit}")]
    TooLarge { length: usize, limit: usize },
}

impl From<FaiError> for CoreError {
    fn from(value: FaiError) -> Self {
        let code = match value {
            FaiError::BadMagic(_) => codes::FRAMING_BAD_MAGIC,
            FaiError::BadVersion(_) => codes::FRAMING_BAD_VERSION,
            FaiError::BadChecksum { .. } => codes::FRAMING_BAD_CHECKSUM,
            FaiError::ReservedNotZero => codes::FRAMING_RESERVED,
            FaiError::NegativeLength(_) => codes::FRAMING_NEGATIVE_LENGTH,
            FaiError::TooLarge { .. } => codes::FRAMING_TOO_LARGE,
        };
        CoreError::new(code, value.to_string())
    }
}

/// 解析后的 32 字节头。
///
/// | 偏移 | 长度 | 字段 |
/// |---|---|---|
/// | 0 | 2 | magic |
/// | 2 | 1 | version |
/// | 3 | 1 | head_ex_len |
/// | 4 | 4 | body_len（有符号） |
/// | 8 | 2 | checksum（有符号） |
/// | 10 | 2 | flag |
/// | 12 | 4 | flow |
/// | 16 | 4 | aid |
/// | 20 | 2 | cmd |
/// | 22 | 2 | result |
/// | 24 | 2 | wid |
/// | 26 | 6 | 保留，必须为零 |
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaiHeader {
    pub head_ex_len: u8,
    pub body_len: i32,
    pub flag: u16,
    pub flow: u32,
    pub aid: u32,
    pub cmd: u16,
    pub result: u16,
    pub wid: u16,
}

impl FaiHeader {
    /// 编码为网络字节序，并写入校验和。
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut raw = [0u8; HEADER_LEN];
        raw[0..2].copy_from_slice(&MAGIC.to_be_bytes());
        raw[2] = VERSION;
        raw[3] = self.head_ex_len;
        raw[4..8].copy_from_slice(&self.body_len.to_be_bytes());
        raw[10..12].copy_from_slice(&self.flag.to_be_bytes());
        raw[12..16].copy_from_slice(&self.flow.to_be_bytes());
        raw[16..20].copy_from_slice(&self.aid.to_be_bytes());
        raw[20..22].copy_from_slice(&self.cmd.to_be_bytes());
        raw[22..24].copy_from_slice(&self.result.to_be_bytes());
        raw[24..26].copy_from_slice(&self.wid.to_be_bytes());
        let sum = checksum(&raw);
        raw[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_be_bytes());
        raw
    }

    /// 按 魔数 → 版本 → 校验和 → 保留字段 → 体长 的顺序校验并解析。
    pub fn decode(raw: &[u8; HEADER_LEN]) -> Result<Self, FaiError> {
        let magic = u16::from_be_bytes([raw[0], raw[1]]);
        if magic != MAGIC {
            return Err(FaiError::BadMagic(magic));
        }
        if raw[2] != VERSION {
            return Err(FaiError::BadVersion(raw[2]));
        }
        let carried = i16::from_be_bytes([raw[8], raw[9]]);
        let mut zeroed = *raw;
        zeroed[CHECKSUM_OFFSET] = 0;
        zeroed[CHECKSUM_OFFSET + 1] = 0;
        let computed = checksum(&zeroed);
        if carried != computed {
            return Err(FaiError::BadChecksum { carried, computed });
        }
        if raw[RESERVED].iter().any(|byte| *byte != 0) {
            return Err(FaiError::ReservedNotZero);
        }
        let body_len = i32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        if body_len < 0 {
            return Err(FaiError::NegativeLength(body_len));
        }
        Ok(Self {
            head_ex_len: raw[3],
            body_len,
            flag: u16::from_be_bytes([raw[10], raw[11]]),
            flow: u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]),
            aid: u32::from_be_bytes([raw[16], raw[17], raw[18], raw[19]]),
            cmd: u16::from_be_bytes([raw[20], raw[21]]),
            result: u16::from_be_bytes([raw[22], raw[23]]),
            wid: u16::from_be_bytes([raw[24], raw[25]]),
        })
    }

    /// 头 + 扩展 + 体的总长度。
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + usize::from(self.head_ex_len) + self.body_len.max(0) as usize
    }
}

/// 16 位反码折叠和。
///
/// 以大端 16 位字累加，奇数长度时末字节作为高位补齐；高 16 位折回低 16 位两次后取反。
pub fn checksum(bytes: &[u8]) -> i16 {
    let mut sum: u32 = 0;
    let mut words = bytes.chunks_exact(2);
    for word in words.by_ref() {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum = (sum >> 16) + (sum & 0xffff);
    sum = (sum >> 16) + (sum & 0xffff);
    (!(sum as u16)) as i16
}
