//! In-memory FIFO pipe, grounded on the reference `pipe.c`: one fixed
//! `PIPE_CAPACITY`-byte ring buffer shared between a read end and a write
//! end, created together by [`pipe_create`]. Both ends are
//! [`crate::vfs::FileOps`] objects over the same [`Inner`], shared via
//! `Arc` per the design's note on pipe ownership (§9).

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::PIPE_CAPACITY;
use crate::error::{KernelError, KResult};
use crate::lock::BoundedSpinlock;
use crate::vfs::FileOps;
use quark_sys::open_flags::O_NONBLOCK;

struct Inner {
    // Heap-backed rather than a `[u8; PIPE_CAPACITY]` inline array: 20 KiB
    // would not fit a single task's kernel stack on the way to `Arc::new`.
    buf: Vec<u8>,
    len: usize,
    writer_open: bool,
    reader_open: bool,
}

impl Inner {
    fn new() -> Self {
        Inner { buf: alloc::vec![0u8; PIPE_CAPACITY], len: 0, writer_open: true, reader_open: true }
    }
}

struct Pipe {
    inner: BoundedSpinlock<Inner>,
}

pub struct ReadEnd {
    pipe: Arc<Pipe>,
    flags: u32,
}

pub struct WriteEnd {
    pipe: Arc<Pipe>,
}

/// Creates a pipe, returning `(read_end, write_end)` ready to be installed
/// as a task's file descriptors (§4.10: "the reader gets flags READ_ONLY,
/// callbacks `{read}`; the writer gets WRITE_ONLY, callbacks `{write}`").
pub fn pipe_create(flags: u32) -> (Arc<dyn FileOps>, Arc<dyn FileOps>) {
    let pipe = Arc::new(Pipe { inner: BoundedSpinlock::new(Inner::new()) });
    let read_end = Arc::new(ReadEnd { pipe: pipe.clone(), flags });
    let write_end = Arc::new(WriteEnd { pipe });
    (read_end, write_end)
}

impl FileOps for ReadEnd {
    /// Halt-waits for data per §4.7's suspension-point (a): the only
    /// in-kernel blocking read. Interrupts must already be enabled (they
    /// are, on the syscall path — the gate clears IF, but nothing stops a
    /// handler from `sti`-ing before it halts) so the timer tick can still
    /// preempt into another task while this one waits.
    fn read(&self, _offset: u64, buf: &mut [u8]) -> KResult<usize> {
        loop {
            {
                let mut inner = self.pipe.inner.lock().ok_or(KernelError::WouldBlock)?;
                if inner.len > 0 {
                    let n = buf.len().min(inner.len);
                    buf[..n].copy_from_slice(&inner.buf[..n]);
                    inner.buf.copy_within(n..inner.len, 0);
                    inner.len -= n;
                    return Ok(n);
                }
                if !inner.writer_open {
                    return Ok(0);
                }
                if self.flags & O_NONBLOCK != 0 {
                    return Err(KernelError::WouldBlock);
                }
            }
            unsafe {
                core::arch::asm!("sti", "hlt", options(nostack, preserves_flags));
            }
        }
    }
}

impl Drop for ReadEnd {
    fn drop(&mut self) {
        if let Some(mut inner) = self.pipe.inner.lock() {
            inner.reader_open = false;
        }
    }
}

impl FileOps for WriteEnd {
    /// Never blocks on a full pipe (the recorded Open Question decision for
    /// §4.10): returns `NoSpace` rather than truncating or waiting for the
    /// reader to drain.
    fn write(&self, _offset: u64, buf: &[u8]) -> KResult<usize> {
        let mut inner = self.pipe.inner.lock().ok_or(KernelError::WouldBlock)?;
        if !inner.reader_open {
            return Err(KernelError::BrokenPipe);
        }
        if inner.len + buf.len() > PIPE_CAPACITY {
            return Err(KernelError::NoSpace);
        }
        let start = inner.len;
        inner.buf[start..start + buf.len()].copy_from_slice(buf);
        inner.len += buf.len();
        Ok(buf.len())
    }
}

impl Drop for WriteEnd {
    fn drop(&mut self) {
        if let Some(mut inner) = self.pipe.inner.lock() {
            inner.writer_open = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    #[test]
    fn write_then_read_round_trips() {
        let (r, w) = pipe_create(0);
        w.write(0, b"abc").unwrap();
        let mut buf = [0u8; 8];
        let n = r.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");
    }

    #[test]
    fn concatenates_multiple_writes_in_order() {
        let (r, w) = pipe_create(0);
        w.write(0, b"w1-").unwrap();
        w.write(0, b"w2-").unwrap();
        w.write(0, b"w3").unwrap();
        let mut buf = [0u8; 16];
        let n = r.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"w1-w2-w3");
    }

    #[test]
    fn write_past_capacity_fails_without_blocking() {
        let (_r, w) = pipe_create(0);
        let big = alloc::vec![0u8; PIPE_CAPACITY + 1];
        assert_eq!(w.write(0, &big).unwrap_err(), KernelError::NoSpace);
    }

    #[test]
    fn nonblocking_read_on_empty_pipe_would_block() {
        let (r, _w) = pipe_create(O_NONBLOCK);
        let mut buf = [0u8; 8];
        assert_eq!(r.read(0, &mut buf).unwrap_err(), KernelError::WouldBlock);
    }

    #[test]
    fn read_after_writer_dropped_returns_eof() {
        let (r, w) = pipe_create(0);
        drop(w);
        let mut buf = [0u8; 8];
        assert_eq!(r.read(0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn reader_drop_marks_broken_pipe_for_writer() {
        let (r, w) = pipe_create(0);
        drop(r);
        assert_eq!(w.write(0, b"x").unwrap_err(), KernelError::BrokenPipe);
    }

    #[allow(dead_code)]
    fn _assert_object_safe(_: Arc<dyn FileOps>) {}
}
