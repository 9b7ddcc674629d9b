//! 引用计数的字节缓冲。
//!
//! # 设计背景（Why）
//! - 反应器线程读到的字节需要在过滤链之间传递、切分成帧体，再交给业务线程，整个过程不应复制；
//! - `free()` 之后的访问返回可检测的 [`BufferError::Released`]，不会读到已归还的内存。
//!
//! # 结构（How）
//! - 独占阶段持有 [`BytesMut`]，可写；一旦调用 [`ByteBuffer::slice`]，底层冻结为 [`Bytes`]，
//!   所有视图共享同一块内存，写入被拒绝，直到其余视图全部释放（`Bytes::try_into_mut` 成功）；
//! - 所有视图共享一个 `Lease`，任一视图调用 [`ByteBuffer::free`] 后，其余视图的访问都返回
//!   [`BufferError::Released`]。
//!
//! # 契约（What）
//! - `read ≤ write ≤ capacity` 恒成立；越过写游标读取或越过容量写入返回 [`BufferError::OutOfBounds`]；
//! - 跨线程移交依赖所有权转移：修改需要 `&mut self`，移走之后原线程无法再写。

use std::{
    fmt, mem,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::{Bytes, BytesMut};

use crate::error::{CoreError, codes};

/// 缓冲操作失败的细分原因。
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// 访问区间越过写游标或容量。
    #[error("{op} out of bounds: offset {offset} + len {len} exceeds limit {limit}")]
    OutOfBounds {
        op: &'static str,
        offset: usize,
        len: usize,
        limit: usize,
    },
    /// 底层区域已被 `free()` 释放。
    #[error("buffer region has been released")]
    Released,
    /// 仍有切片共享底层区域，拒绝写入。
    #[error("buffer region is shared by outstanding slices; writes are rejected")]
    Shared,
}

impl From<BufferError> for CoreError {
    fn from(value: BufferError) -> Self {
        let code = match value {
            BufferError::OutOfBounds { .. } => codes::BUFFER_OUT_OF_BOUNDS,
            BufferError::Released => codes::BUFFER_RELEASED,
            BufferError::Shared => codes::BUFFER_SHARED,
        };
        CoreError::new(code, value.to_string())
    }
}

#[derive(Debug, Default)]
struct Lease {
    released: AtomicBool,
}

enum Storage {
    Owned(BytesMut),
    Shared(Bytes),
    Released,
}

impl Storage {
    fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Owned(buf) => buf,
            Storage::Shared(buf) => buf,
            Storage::Released => &[],
        }
    }
}

/// 拥有独立读/写游标、支持零拷贝切片的字节缓冲。
///
/// ```rust
/// use fai_core::buffer::ByteBuffer;
///
/// let mut buf = ByteBuffer::allocate(8);
/// buf.put(b"abcdef").unwrap();
/// let view = buf.slice(2, 3).unwrap();
/// assert_eq!(view.readable().unwrap(), b"cde");
/// // 视图存活期间写入被拒绝。
/// assert!(buf.put(b"g").is_err());
/// drop(view);
/// buf.put(b"g").unwrap();
/// ```
pub struct ByteBuffer {
    storage: Storage,
    read: usize,
    write: usize,
    lease: Arc<Lease>,
}

impl ByteBuffer {
    /// 分配固定容量的可写缓冲。
    pub fn allocate(capacity: usize) -> Self {
        Self {
            storage: Storage::Owned(BytesMut::zeroed(capacity)),
            read: 0,
            write: 0,
            lease: Arc::new(Lease::default()),
        }
    }

    /// 零拷贝接管已有字节，写游标位于末尾。
    pub fn wrap(data: impl Into<Bytes>) -> Self {
        let bytes: Bytes = data.into();
        let len = bytes.len();
        Self {
            storage: Storage::Shared(bytes),
            read: 0,
            write: len,
            lease: Arc::new(Lease::default()),
        }
    }

    /// 复制切片内容构造独占缓冲。
    pub fn copy_from_slice(data: &[u8]) -> Self {
        let mut buf = Self::allocate(data.len());
        buf.put_unchecked(data);
        buf
    }

    /// 当前容量；释放后为 0。
    pub fn capacity(&self) -> usize {
        self.storage.as_slice().len()
    }

    /// 读游标位置。
    pub fn read_index(&self) -> usize {
        self.read
    }

    /// 写游标位置。
    pub fn write_index(&self) -> usize {
        self.write
    }

    /// 可读字节数。
    pub fn readable_bytes(&self) -> usize {
        self.write - self.read
    }

    /// 剩余可写字节数。
    pub fn writable_bytes(&self) -> usize {
        self.capacity().saturating_sub(self.write)
    }

    /// 是否已释放（自身或任一共享视图调用过 `free()`）。
    pub fn is_released(&self) -> bool {
        self.lease.released.load(Ordering::Acquire)
    }

    /// 底层区域是否被多个视图共享。
    pub fn is_shared(&self) -> bool {
        matches!(self.storage, Storage::Shared(_))
    }

    /// 在写游标处追加数据。
    pub fn put(&mut self, data: &[u8]) -> Result<(), BufferError> {
        self.ensure_live()?;
        let capacity = self.capacity();
        if self.write + data.len() > capacity {
            return Err(BufferError::OutOfBounds {
                op: "put",
                offset: self.write,
                len: data.len(),
                limit: capacity,
            });
        }
        self.make_unique()?;
        self.put_unchecked(data);
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<(), BufferError> {
        self.put(&[value])
    }

    pub fn put_u16(&mut self, value: u16) -> Result<(), BufferError> {
        self.put(&value.to_be_bytes())
    }

    pub fn put_u32(&mut self, value: u32) -> Result<(), BufferError> {
        self.put(&value.to_be_bytes())
    }

    /// 读取绝对位置 `index` 处的字节，不移动游标。
    pub fn get(&self, index: usize) -> Result<u8, BufferError> {
        self.ensure_live()?;
        if index >= self.write {
            return Err(BufferError::OutOfBounds {
                op: "get",
                offset: index,
                len: 1,
                limit: self.write,
            });
        }
        Ok(self.storage.as_slice()[index])
    }

    /// 复制出 `[offset, offset + len)` 区间。
    pub fn array(&self, offset: usize, len: usize) -> Result<Vec<u8>, BufferError> {
        self.ensure_live()?;
        self.check_written("array", offset, len)?;
        Ok(self.storage.as_slice()[offset..offset + len].to_vec())
    }

    /// 返回共享同一底层区域的零拷贝视图。
    ///
    /// 调用后原缓冲转入共享态：视图存活期间两侧的写入都会返回 [`BufferError::Shared`]。
    pub fn slice(&mut self, offset: usize, len: usize) -> Result<ByteBuffer, BufferError> {
        self.ensure_live()?;
        self.check_written("slice", offset, len)?;
        let view = self.freeze().slice(offset..offset + len);
        Ok(ByteBuffer {
            storage: Storage::Shared(view),
            read: 0,
            write: len,
            lease: Arc::clone(&self.lease),
        })
    }

    /// 当前可读区间。
    pub fn readable(&self) -> Result<&[u8], BufferError> {
        self.ensure_live()?;
        Ok(&self.storage.as_slice()[self.read..self.write])
    }

    /// 读游标前进 `count` 字节。
    pub fn advance(&mut self, count: usize) -> Result<(), BufferError> {
        self.ensure_live()?;
        if count > self.readable_bytes() {
            return Err(BufferError::OutOfBounds {
                op: "advance",
                offset: self.read,
                len: count,
                limit: self.write,
            });
        }
        self.read += count;
        Ok(())
    }

    /// 零拷贝取走前 `count` 个可读字节。
    pub fn split_to(&mut self, count: usize) -> Result<ByteBuffer, BufferError> {
        let head = self.slice(self.read, count)?;
        self.read += count;
        Ok(head)
    }

    pub fn get_u8(&mut self) -> Result<u8, BufferError> {
        let value = self.get(self.read)?;
        self.read += 1;
        Ok(value)
    }

    pub fn get_u16(&mut self) -> Result<u16, BufferError> {
        let raw = self.take_array::<2>("get_u16")?;
        Ok(u16::from_be_bytes(raw))
    }

    pub fn get_u32(&mut self) -> Result<u32, BufferError> {
        let raw = self.take_array::<4>("get_u32")?;
        Ok(u32::from_be_bytes(raw))
    }

    /// 写游标之后的空闲区，供套接字读直接填充；填充后调用 [`ByteBuffer::commit`]。
    pub fn writable_mut(&mut self) -> Result<&mut [u8], BufferError> {
        self.ensure_live()?;
        let write = self.write;
        let owned = self.make_unique()?;
        Ok(&mut owned[write..])
    }

    /// 确认 `count` 字节已写入空闲区。
    pub fn commit(&mut self, count: usize) -> Result<(), BufferError> {
        self.ensure_live()?;
        let capacity = self.capacity();
        if self.write + count > capacity {
            return Err(BufferError::OutOfBounds {
                op: "commit",
                offset: self.write,
                len: count,
                limit: capacity,
            });
        }
        self.write += count;
        Ok(())
    }

    /// 保证至少还有 `additional` 字节可写，必要时扩容。
    pub fn reserve(&mut self, additional: usize) -> Result<(), BufferError> {
        self.ensure_live()?;
        if self.writable_bytes() >= additional {
            return Ok(());
        }
        let target = self.write + additional;
        let owned = self.make_unique()?;
        owned.resize(target, 0);
        Ok(())
    }

    /// 把未读数据搬到区首，回收已读空间。
    pub fn compact(&mut self) -> Result<(), BufferError> {
        self.ensure_live()?;
        if self.read == 0 {
            return Ok(());
        }
        let (read, write) = (self.read, self.write);
        let owned = self.make_unique()?;
        owned.copy_within(read..write, 0);
        self.write = write - read;
        self.read = 0;
        Ok(())
    }

    /// 同时回卷读写游标以复用缓冲。
    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    /// 显式释放底层区域；所有共享视图随之失效。
    pub fn free(&mut self) {
        self.lease.released.store(true, Ordering::Release);
        self.storage = Storage::Released;
        self.read = 0;
        self.write = 0;
    }

    /// 以零拷贝方式取出可读区间。
    pub fn into_bytes(mut self) -> Result<Bytes, BufferError> {
        self.ensure_live()?;
        let (read, write) = (self.read, self.write);
        Ok(self.freeze().slice(read..write))
    }

    /// 复制出可读区间。
    pub fn to_vec(&self) -> Result<Vec<u8>, BufferError> {
        self.readable().map(<[u8]>::to_vec)
    }

    fn ensure_live(&self) -> Result<(), BufferError> {
        if self.is_released() {
            return Err(BufferError::Released);
        }
        Ok(())
    }

    fn check_written(&self, op: &'static str, offset: usize, len: usize) -> Result<(), BufferError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.write => Ok(()),
            _ => Err(BufferError::OutOfBounds {
                op,
                offset,
                len,
                limit: self.write,
            }),
        }
    }

    fn take_array<const N: usize>(&mut self, op: &'static str) -> Result<[u8; N], BufferError> {
        self.ensure_live()?;
        self.check_written(op, self.read, N)?;
        let mut raw = [0u8; N];
        raw.copy_from_slice(&self.storage.as_slice()[self.read..self.read + N]);
        self.read += N;
        Ok(raw)
    }

    fn put_unchecked(&mut self, data: &[u8]) {
        if let Storage::Owned(buf) = &mut self.storage {
            buf[self.write..self.write + data.len()].copy_from_slice(data);
            self.write += data.len();
        }
    }

    fn freeze(&mut self) -> &Bytes {
        if let Storage::Owned(_) = self.storage
            && let Storage::Owned(owned) = mem::replace(&mut self.storage, Storage::Released)
        {
            self.storage = Storage::Shared(owned.freeze());
        }
        match &self.storage {
            Storage::Shared(bytes) => bytes,
            _ => empty_bytes(),
        }
    }

    fn make_unique(&mut self) -> Result<&mut BytesMut, BufferError> {
        if let Storage::Shared(_) = self.storage
            && let Storage::Shared(bytes) = mem::replace(&mut self.storage, Storage::Released)
        {
            self.storage = match bytes.try_into_mut() {
                Ok(owned) => Storage::Owned(owned),
                Err(bytes) => {
                    self.storage = Storage::Shared(bytes);
                    return Err(BufferError::Shared);
                }
            };
        }
        match &mut self.storage {
            Storage::Owned(owned) => Ok(owned),
            Storage::Shared(_) => Err(BufferError::Shared),
            Storage::Released => Err(BufferError::Released),
        }
    }
}

fn empty_bytes() -> &'static Bytes {
    static EMPTY: Bytes = Bytes::from_static(&[]);
    &EMPTY
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("read", &self.read)
            .field("write", &self.write)
            .field("capacity", &self.capacity())
            .field("shared", &self.is_shared())
            .field("released", &self.is_released())
            .finish()
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(value: Vec<u8>) -> Self {
        ByteBuffer::wrap(value)
    }
}

impl From<Bytes> for ByteBuffer {
    fn from(value: Bytes) -> Self {
        ByteBuffer::wrap(value)
    }
}

impl From<&[u8]> for ByteBuffer {
    fn from(value: &[u8]) -> Self {
        ByteBuffer::copy_from_slice(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursors_respect_bounds() {
        let mut buf = ByteBuffer::allocate(4);
        buf.put(b"abc").unwrap();
        assert_eq!(buf.readable_bytes(), 3);
        assert!(matches!(
            buf.put(b"de"),
            Err(BufferError::OutOfBounds { op: "put", .. })
        ));
        assert_eq!(buf.get(2).unwrap(), b'c');
        assert!(buf.get(3).is_err(), "reading past the write cursor must fail");
        assert!(buf.array(1, 3).is_err());
        assert_eq!(buf.array(1, 2).unwrap(), b"bc");
        assert!(buf.advance(4).is_err());
    }

    #[test]
    fn slices_share_memory_and_block_writes() {
        let mut buf = ByteBuffer::allocate(8);
        buf.put(b"hello").unwrap();
        let view = buf.slice(1, 3).unwrap();
        assert_eq!(view.readable().unwrap(), b"ell");
        assert!(buf.is_shared());
        assert_eq!(buf.put(b"!"), Err(BufferError::Shared));
        drop(view);
        buf.put(b"!").unwrap();
        assert_eq!(buf.readable().unwrap(), b"hello!");
    }

    #[test]
    fn free_invalidates_every_view() {
        let mut buf = ByteBuffer::allocate(8);
        buf.put(b"abcd").unwrap();
        let mut view = buf.slice(0, 2).unwrap();
        buf.free();
        assert_eq!(view.readable(), Err(BufferError::Released));
        assert_eq!(view.get_u8(), Err(BufferError::Released));
        assert!(buf.put(b"x").is_err());
        assert_eq!(buf.capacity(), 0);
    }

    #[test]
    fn reset_rewinds_and_compact_reclaims() {
        let mut buf = ByteBuffer::allocate(6);
        buf.put(b"abcdef").unwrap();
        buf.advance(4).unwrap();
        buf.compact().unwrap();
        assert_eq!(buf.read_index(), 0);
        assert_eq!(buf.readable().unwrap(), b"ef");
        buf.put(b"gh").unwrap();
        assert_eq!(buf.readable().unwrap(), b"efgh");
        buf.reset();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), 6);
    }

    #[test]
    fn split_to_consumes_without_copy() {
        let mut buf = ByteBuffer::wrap(b"headbody".to_vec());
        let head = buf.split_to(4).unwrap();
        assert_eq!(head.readable().unwrap(), b"head");
        assert_eq!(buf.readable().unwrap(), b"body");
        assert_eq!(buf.get_u16().unwrap(), u16::from_be_bytes(*b"bo"));
    }

    #[test]
    fn reserve_and_socket_style_fill() {
        let mut buf = ByteBuffer::allocate(2);
        buf.reserve(6).unwrap();
        let spare = buf.writable_mut().unwrap();
        assert!(spare.len() >= 6);
        spare[..3].copy_from_slice(b"xyz");
        buf.commit(3).unwrap();
        assert_eq!(buf.to_vec().unwrap(), b"xyz");
        assert!(buf.commit(100).is_err());
    }

    #[test]
    fn wrapped_vectors_become_writable_after_reset() {
        let mut buf = ByteBuffer::wrap(vec![1, 2, 3]);
        buf.reset();
        buf.put(&[9]).unwrap();
        assert_eq!(buf.readable().unwrap(), &[9]);
    }

    #[test]
    fn errors_convert_into_core_errors() {
        let err: CoreError = BufferError::Released.into();
        assert_eq!(err.code(), codes::BUFFER_RELEASED);
        assert_eq!(err.category(), crate::error::ErrorCategory::Bounds);
    }
}
