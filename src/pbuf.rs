// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! A fixed-size-class packet buffer pool.
//!
//! Every [`Pbuf`] reserves [`HEADROOM`] bytes ahead of its payload so a
//! lower layer (the proxy framer, in this crate) can prepend a header by
//! sliding the start index backward rather than copying the payload
//! forward. [`Pool::alloc`] hands out buffers by exact requested size; a
//! freed buffer is pushed back onto that size's free list and is the next
//! thing `alloc` returns for the same size, so a steady-state workload
//! (always asking for MTU-sized buffers) never touches the allocator past
//! warm-up.

use std::collections::HashMap;

/// Bytes of headroom reserved ahead of the payload in every buffer, enough
/// for the 28-byte proxy header (see `crate::proxy`) with room to spare.
pub const HEADROOM: usize = 128;

/// Buffers larger than this are never cached on free; they are simply
/// dropped. This bounds the pool's steady-state memory to workloads built
/// from ordinary MTU-sized packets.
pub const MAX_POOLED_SIZE: usize = 2048;

/// A single pooled packet buffer.
///
/// `start` is the offset of the current payload within `data`; `len` is
/// the effective payload length; `data.len()` is the buffer's total
/// capacity (`tot_len` in the spec's vocabulary). Prepending a header
/// moves `start` backward into the headroom instead of reallocating.
pub struct Pbuf {
    data: Vec<u8>,
    start: usize,
    len: usize,
}

impl Pbuf {
    fn new(requested: usize) -> Pbuf {
        let data = vec![0u8; HEADROOM + requested];
        Pbuf {
            data,
            start: HEADROOM,
            len: 0,
        }
    }

    /// The size this buffer was originally allocated for; used as the free
    /// list key on release.
    fn size_class(&self) -> usize {
        self.data.len() - HEADROOM
    }

    /// The buffer's total capacity starting at the current payload offset
    /// (`tot_len` in the spec).
    pub fn tot_len(&self) -> usize {
        self.data.len() - self.start
    }

    /// Effective payload length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.start..self.start + self.len]
    }

    /// Copies `bytes` into the payload region starting at `start`,
    /// replacing whatever was there, and records the new effective length.
    pub fn take(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.tot_len(),
            "buffer too small to take {} bytes",
            bytes.len()
        );
        self.data[self.start..self.start + bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
    }

    /// Copies `len` bytes out of the payload starting at `offset` into
    /// `dst`.
    pub fn copy_partial(&self, dst: &mut [u8], len: usize, offset: usize) {
        assert!(offset + len <= self.len, "copy_partial out of range");
        dst[..len].copy_from_slice(&self.data[self.start + offset..self.start + offset + len]);
    }

    /// Moves the payload start backward by `hdr.len()` bytes within the
    /// reserved headroom and writes `hdr` into the freed space, growing
    /// the effective length by `hdr.len()`. Panics if there isn't enough
    /// headroom left, which would indicate a caller prepending more
    /// headers than the pool was sized for.
    pub fn prepend(&mut self, hdr: &[u8]) {
        assert!(
            self.start >= hdr.len(),
            "not enough headroom to prepend {} bytes",
            hdr.len()
        );
        self.start -= hdr.len();
        self.len += hdr.len();
        self.data[self.start..self.start + hdr.len()].copy_from_slice(hdr);
    }

    /// Strips `n` bytes from the front of the payload, the inverse of
    /// `prepend`, used when removing a proxy header on receive.
    pub fn strip_front(&mut self, n: usize) {
        assert!(n <= self.len, "strip_front past payload end");
        self.start += n;
        self.len -= n;
    }
}

/// A free-list allocator for `Pbuf`s, indexed by exact requested size.
///
/// Not `Sync`; the data-plane loop is the pool's only owner, per the
/// single-threaded concurrency model (§5).
#[derive(Default)]
pub struct Pool {
    free: HashMap<usize, Vec<Pbuf>>,
}

impl Pool {
    pub fn new() -> Pool {
        Pool {
            free: HashMap::new(),
        }
    }

    /// Returns a buffer with at least `size` bytes of payload capacity
    /// beyond the fixed headroom, reusing a freed buffer of the same
    /// exact size if one is available. Never fails: allocation exhaustion
    /// in this pool means the process is out of memory, which is not a
    /// condition the pool itself models as a recoverable `None` -- callers
    /// that want bounded memory should cap how many `Pbuf`s they hold live
    /// rather than rely on `alloc` returning `None`.
    pub fn alloc(&mut self, size: usize) -> Pbuf {
        if let Some(list) = self.free.get_mut(&size) {
            if let Some(mut buf) = list.pop() {
                buf.start = HEADROOM;
                buf.len = 0;
                return buf;
            }
        }
        Pbuf::new(size)
    }

    /// Returns `buf` to its size class's free list, unless its size class
    /// exceeds `MAX_POOLED_SIZE`, in which case it is simply dropped.
    pub fn free(&mut self, buf: Pbuf) {
        let size = buf.size_class();
        if size > MAX_POOLED_SIZE {
            return;
        }
        self.free.entry(size).or_default().push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_reserves_headroom() {
        let mut pool = Pool::new();
        let buf = pool.alloc(1500);
        assert_eq!(buf.tot_len(), 1500);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn free_list_is_lifo_and_reused_on_same_size() {
        let mut pool = Pool::new();
        let mut a = pool.alloc(1500);
        a.take(&[1, 2, 3]);
        let a_ptr = a.data.as_ptr();
        pool.free(a);

        let b = pool.alloc(1500);
        assert_eq!(b.data.as_ptr(), a_ptr, "expected the freed buffer back");
        assert_eq!(b.len(), 0, "reused buffer must reset its length");
    }

    #[test]
    fn oversized_buffers_are_not_pooled() {
        let mut pool = Pool::new();
        let a = pool.alloc(MAX_POOLED_SIZE + 1);
        let ptr = a.data.as_ptr();
        pool.free(a);
        let b = pool.alloc(MAX_POOLED_SIZE + 1);
        assert_ne!(b.data.as_ptr(), ptr, "oversized buffer must not be cached");
    }

    #[test]
    fn prepend_and_strip_round_trip() {
        let mut pool = Pool::new();
        let mut buf = pool.alloc(100);
        buf.take(b"hello");
        buf.prepend(&[0xAA; 28]);
        assert_eq!(buf.len(), 5 + 28);
        assert_eq!(&buf.as_slice()[..28], &[0xAA; 28][..]);
        buf.strip_front(28);
        assert_eq!(buf.as_slice(), b"hello");
    }

    #[test]
    fn different_sizes_get_independent_free_lists() {
        let mut pool = Pool::new();
        let small = pool.alloc(64);
        let large = pool.alloc(1500);
        pool.free(small);
        pool.free(large);
        assert_eq!(pool.free.get(&64).map(Vec::len), Some(1));
        assert_eq!(pool.free.get(&1500).map(Vec::len), Some(1));
    }
}
