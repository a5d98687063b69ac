//! Chained Byte Buffer
//!
//! A `Buffer` is an ordered chain of immutable `Bytes` segments. Appending
//! pushes a new segment instead of growing an existing allocation, so a
//! segment that is shared with another handle (for example a packet that was
//! split off the read buffer and is now queued for write on a backend) is
//! never reallocated or modified underneath that other handle.
//!
//! ```text
//!   Buffer (len = 11)
//!   ┌──────────┐   ┌──────────────┐   ┌────────┐
//!   │ seg 0: 4 │──>│ seg 1: 5     │──>│ seg 2:2│
//!   └──────────┘   └──────────────┘   └────────┘
//!        ▲ shared with a clone, refcounted by `Bytes`
//! ```
//!
//! Mutation is copy-on-write at segment granularity: `overwrite()` copies only
//! the segments it touches into fresh storage owned by this handle.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::io::IoSlice;
use std::ops::BitOr;

/// Markers carried alongside the bytes of a buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BufferFlags(u8);

impl BufferFlags {
    /// The buffer holds only whole protocol frames.
    pub const COMPLETE_PACKETS: BufferFlags = BufferFlags(1 << 0);
    /// The buffer is a session command that must be replayed on new backends.
    pub const SESSION_COMMAND: BufferFlags = BufferFlags(1 << 1);
    /// The router wants the complete response to this buffer.
    pub const COLLECT_RESULT: BufferFlags = BufferFlags(1 << 2);
    /// The buffer carries opaque bulk-load data.
    pub const BULK_DATA: BufferFlags = BufferFlags(1 << 3);

    pub const fn empty() -> Self {
        BufferFlags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: BufferFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: BufferFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: BufferFlags) -> BufferFlags {
        BufferFlags(self.0 | rhs.0)
    }
}

/// A reference-counted, chainable byte buffer.
///
/// Cloning (or calling [`Buffer::clone_shallow`]) only bumps the refcount of
/// each segment; no payload bytes are copied.
#[derive(Clone, Default)]
pub struct Buffer {
    /// Non-empty segments in stream order
    segments: VecDeque<Bytes>,
    /// Cached sum of segment lengths
    len: usize,
    flags: BufferFlags,
}

impl Buffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer holding a copy of `data`.
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self::from(Bytes::copy_from_slice(data))
    }

    /// Appends bytes as a new segment. Existing segments are left untouched.
    pub fn append(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.segments.push_back(data);
    }

    /// Moves every segment of `other` to the end of this buffer.
    pub fn append_buffer(&mut self, mut other: Buffer) {
        self.len += other.len;
        self.segments.append(&mut other.segments);
    }

    /// Advances the read position by up to `n` bytes without copying.
    ///
    /// Returns the number of bytes actually consumed, which is short when
    /// `n` exceeds the buffered length.
    pub fn consume(&mut self, n: usize) -> usize {
        let consumed = n.min(self.len);
        let mut left = consumed;

        while left > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            if front.len() <= left {
                left -= front.len();
                self.segments.pop_front();
            } else {
                front.advance(left);
                left = 0;
            }
        }

        self.len -= consumed;
        consumed
    }

    /// Detaches the first `n` bytes (clamped to the length) as a new buffer
    /// sharing storage with this one.
    pub fn split_to(&mut self, n: usize) -> Buffer {
        let n = n.min(self.len);
        let mut out = Buffer::new();
        let mut left = n;

        while left > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            if front.len() <= left {
                left -= front.len();
                if let Some(seg) = self.segments.pop_front() {
                    out.append(seg);
                }
            } else {
                out.append(front.split_to(left));
                left = 0;
            }
        }

        self.len -= out.len;
        out
    }

    /// Returns a new handle sharing every segment with this buffer.
    pub fn clone_shallow(&self) -> Buffer {
        self.clone()
    }

    /// Total logical length in bytes. O(1).
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Alias of [`Buffer::len`].
    #[inline]
    pub fn length(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of chained segments.
    #[cfg(test)]
    pub(crate) fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Returns the byte at logical offset `index`.
    pub fn byte_at(&self, index: usize) -> Option<u8> {
        if index >= self.len {
            return None;
        }
        let mut offset = index;
        for seg in &self.segments {
            if offset < seg.len() {
                return Some(seg[offset]);
            }
            offset -= seg.len();
        }
        None
    }

    /// Copies bytes starting at `offset` into `dst`, returning how many were
    /// copied.
    pub fn copy_to(&self, offset: usize, dst: &mut [u8]) -> usize {
        if offset >= self.len || dst.is_empty() {
            return 0;
        }

        let mut skip = offset;
        let mut written = 0;
        for seg in &self.segments {
            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }
            let src = &seg[skip..];
            skip = 0;
            let n = src.len().min(dst.len() - written);
            dst[written..written + n].copy_from_slice(&src[..n]);
            written += n;
            if written == dst.len() {
                break;
            }
        }
        written
    }

    /// Returns `len` bytes starting at `offset` as one contiguous `Bytes`.
    ///
    /// This is a refcount bump when the range lies inside one segment and a
    /// single copy otherwise. Returns `None` when the range is out of bounds.
    pub fn contiguous(&self, offset: usize, len: usize) -> Option<Bytes> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        if len == 0 {
            return Some(Bytes::new());
        }

        let mut start = offset;
        for seg in &self.segments {
            if start < seg.len() {
                if start + len <= seg.len() {
                    return Some(seg.slice(start..start + len));
                }
                break;
            }
            start -= seg.len();
        }

        let mut out = BytesMut::zeroed(len);
        self.copy_to(offset, &mut out);
        Some(out.freeze())
    }

    /// Returns the whole buffer as one `Bytes`, copying only when chained.
    pub fn to_bytes(&self) -> Bytes {
        match self.segments.len() {
            0 => Bytes::new(),
            1 => self.segments[0].clone(),
            _ => {
                let mut out = BytesMut::with_capacity(self.len);
                for seg in &self.segments {
                    out.extend_from_slice(seg);
                }
                out.freeze()
            }
        }
    }

    /// Copies the whole buffer into a `Vec`.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for seg in &self.segments {
            out.extend_from_slice(seg);
        }
        out
    }

    /// Iterates over the segments in order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.segments.iter().map(|seg| seg.as_ref())
    }

    /// Fills `dst` with slices over the leading segments for vectored writes.
    pub fn io_slices<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        let mut n = 0;
        for (slot, seg) in dst.iter_mut().zip(self.segments.iter()) {
            *slot = IoSlice::new(seg);
            n += 1;
        }
        n
    }

    /// Overwrites a single byte, copying the affected segment first.
    pub fn set_byte(&mut self, index: usize, value: u8) -> bool {
        self.overwrite(index, &[value])
    }

    /// Overwrites `src.len()` bytes starting at `offset`.
    ///
    /// Every touched segment is replaced by a private copy, so handles that
    /// share the old segment keep seeing the old bytes. Returns false (and
    /// changes nothing) when the range is out of bounds.
    pub fn overwrite(&mut self, offset: usize, src: &[u8]) -> bool {
        let Some(end) = offset.checked_add(src.len()) else {
            return false;
        };
        if end > self.len {
            return false;
        }

        let mut seg_start = 0;
        let mut copied = 0;
        for seg in self.segments.iter_mut() {
            let seg_end = seg_start + seg.len();
            if seg_end > offset && seg_start < end {
                let from = offset.max(seg_start) - seg_start;
                let to = end.min(seg_end) - seg_start;
                let mut private = BytesMut::from(&seg[..]);
                private[from..to].copy_from_slice(&src[copied..copied + (to - from)]);
                copied += to - from;
                *seg = private.freeze();
            }
            if seg_end >= end {
                break;
            }
            seg_start = seg_end;
        }
        true
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn set_flag(&mut self, flag: BufferFlags) {
        self.flags.insert(flag);
    }

    pub fn clear_flag(&mut self, flag: BufferFlags) {
        self.flags.remove(flag);
    }

    pub fn has_flag(&self, flag: BufferFlags) -> bool {
        self.flags.contains(flag)
    }
}

impl From<Bytes> for Buffer {
    fn from(data: Bytes) -> Self {
        let mut buf = Buffer::new();
        buf.append(data);
        buf
    }
}

impl From<BytesMut> for Buffer {
    fn from(data: BytesMut) -> Self {
        Buffer::from(data.freeze())
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Buffer::from(Bytes::from(data))
    }
}

impl From<&'static [u8]> for Buffer {
    fn from(data: &'static [u8]) -> Self {
        Buffer::from(Bytes::from_static(data))
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.chunks().flatten().eq(other.chunks().flatten())
    }
}

impl Eq for Buffer {}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("segments", &self.segments.len())
            .field("flags", &self.flags)
            .finish()
    }
}
