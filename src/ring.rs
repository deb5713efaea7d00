//! Expandable single-producer/single-consumer ring buffer over a raw fd.
//!
//! Grounded on `original_source/controller/ring_buffer.hpp`'s
//! `RingBuffer` (monotonic `r`/`w` cursors modulo capacity, doubling
//! `expand()`, two-window fd I/O).

use std::io::{IoSlice, IoSliceMut, Read, Write};

use crate::error::RingError;

pub const RINGBUFFER_IN_SIZ: usize = 1 << 12;
pub const RINGBUFFER_OUT_SIZ: usize = 1 << 12;

pub struct RingBuffer {
    buf: Vec<u8>,
    cap: usize,
    r: u64,
    w: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.max(1);
        RingBuffer {
            buf: vec![0u8; cap],
            cap,
            r: 0,
            w: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn readable(&self) -> usize {
        (self.w - self.r) as usize
    }

    pub fn writable(&self) -> usize {
        self.cap - self.readable()
    }

    /// Best-effort write; returns the number of bytes actually written.
    pub fn write(&mut self, src: &[u8]) -> usize {
        if src.is_empty() {
            return 0;
        }
        let free = self.writable();
        if free == 0 {
            return 0;
        }
        let to_write = src.len().min(free);
        self.copy_in(src, to_write);
        self.w += to_write as u64;
        to_write
    }

    /// Atomic all-or-nothing write.
    pub fn put(&mut self, src: &[u8]) -> Result<(), RingError> {
        let free = self.writable();
        if free < src.len() {
            return Err(RingError::Overflow {
                need: src.len(),
                remaining: free,
            });
        }
        self.copy_in(src, src.len());
        self.w += src.len() as u64;
        Ok(())
    }

    fn copy_in(&mut self, src: &[u8], len: usize) {
        let wmod = (self.w % self.cap as u64) as usize;
        let tail = self.cap - wmod;
        let first = len.min(tail);
        self.buf[wmod..wmod + first].copy_from_slice(&src[..first]);
        let remain = len - first;
        if remain > 0 {
            self.buf[..remain].copy_from_slice(&src[first..first + remain]);
        }
    }

    /// Copy out without consuming.
    pub fn peek(&self, dst: &mut [u8]) -> Result<(), RingError> {
        let avail = self.readable();
        if dst.len() > avail {
            return Err(RingError::OutOfBounds {
                len: dst.len(),
                available: avail,
            });
        }
        let rmod = (self.r % self.cap as u64) as usize;
        let first = dst.len().min(self.cap - rmod);
        dst[..first].copy_from_slice(&self.buf[rmod..rmod + first]);
        let remain = dst.len() - first;
        if remain > 0 {
            dst[first..first + remain].copy_from_slice(&self.buf[..remain]);
        }
        Ok(())
    }

    pub fn consume(&mut self, len: usize) -> Result<(), RingError> {
        if len > self.readable() {
            return Err(RingError::OutOfBounds {
                len,
                available: self.readable(),
            });
        }
        self.r += len as u64;
        Ok(())
    }

    /// Copy and consume.
    pub fn get(&mut self, dst: &mut [u8]) -> Result<(), RingError> {
        self.peek(dst)?;
        self.consume(dst.len())
    }

    /// Current contiguous free window at the write cursor.
    fn free_window(&mut self) -> &mut [u8] {
        let free = self.writable();
        if free == 0 {
            return &mut [];
        }
        let wmod = (self.w % self.cap as u64) as usize;
        let tail = self.cap - wmod;
        let n = free.min(tail);
        &mut self.buf[wmod..wmod + n]
    }

    /// Fill from a reader via up to two non-blocking reads (handles wrap).
    /// Returns total bytes read; `Ok(0)` means EOF, `Err` propagates the
    /// first failing read if nothing was read at all.
    pub fn read_from_fd<R: Read>(&mut self, reader: &mut R) -> std::io::Result<usize> {
        let mut total = 0usize;

        {
            let w1 = self.free_window();
            if w1.is_empty() {
                return Ok(0);
            }
            match reader.read(w1) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    self.w += n as u64;
                    total += n;
                }
                Err(e) => return Err(e),
            }
        }

        if self.writable() > 0 {
            let w2 = self.free_window();
            if !w2.is_empty() {
                match reader.read(w2) {
                    Ok(0) => return Ok(total),
                    Ok(n) => {
                        self.w += n as u64;
                        total += n;
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(total),
                    Err(e) => {
                        if total > 0 {
                            return Ok(total);
                        }
                        return Err(e);
                    }
                }
            }
        }
        Ok(total)
    }

    /// Flush the readable bytes via a single scatter write. Does not consume;
    /// caller consumes the returned count.
    pub fn write_to_fd<W: Write>(&self, writer: &mut W) -> std::io::Result<usize> {
        let len = self.readable();
        if len == 0 {
            return Ok(0);
        }
        let rmod = (self.r % self.cap as u64) as usize;
        let first = len.min(self.cap - rmod);
        let remain = len - first;
        let slices = if remain > 0 {
            vec![
                IoSlice::new(&self.buf[rmod..rmod + first]),
                IoSlice::new(&self.buf[..remain]),
            ]
        } else {
            vec![IoSlice::new(&self.buf[rmod..rmod + first])]
        };
        writer.write_vectored(&slices)
    }

    /// Doubles capacity, preserving unread bytes at offset 0.
    pub fn expand(&mut self) {
        let used = self.readable();
        let new_cap = self.cap * 2;
        let mut nb = vec![0u8; new_cap];
        if used > 0 {
            let rmod = (self.r % self.cap as u64) as usize;
            let first = used.min(self.cap - rmod);
            nb[..first].copy_from_slice(&self.buf[rmod..rmod + first]);
            let remain = used - first;
            if remain > 0 {
                nb[first..first + remain].copy_from_slice(&self.buf[..remain]);
            }
        }
        self.buf = nb;
        self.cap = new_cap;
        self.r = 0;
        self.w = used as u64;
    }
}

/// Helper used by readers that accept scatter buffers directly (mio
/// streams implement `Read`/`Write`, so `read_from_fd`/`write_to_fd` above
/// cover the common case; this is kept for callers that already hold two
/// `IoSliceMut` windows, e.g. a future zero-copy ingest path).
#[allow(dead_code)]
pub fn read_vectored<R: Read>(reader: &mut R, bufs: &mut [IoSliceMut<'_>]) -> std::io::Result<usize> {
    reader.read_vectored(bufs)
}
