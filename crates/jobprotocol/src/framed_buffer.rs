//! Incremental newline framing over a fixed-capacity byte buffer.
//!
//! Bytes are appended as they arrive from a socket or pipe, and complete
//! frames are drained from the front. Whatever follows the last delimiter is
//! kept at the start of the buffer for the next read.

use std::io::{self, Read};

use bstr::ByteSlice as _;
use thiserror::Error;

/// Which byte sequence terminates a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Newline {
    /// `"\r\n"` only. Client commands use this.
    Network,
    /// `"\n"`, with a `"\r"` right before it dropped from the frame. Process
    /// output is not guaranteed to be CRLF terminated.
    Unix,
}

impl Newline {
    /// Finds the first delimiter in `bytes`.
    /// Returns (end of frame content, start of the next frame).
    fn find(self, bytes: &[u8]) -> Option<(usize, usize)> {
        match self {
            Newline::Network => bytes.find(b"\r\n").map(|idx| (idx, idx + 2)),
            Newline::Unix => bytes.find_byte(b'\n').map(|idx| {
                let end = if idx > 0 && bytes[idx - 1] == b'\r' {
                    idx - 1
                } else {
                    idx
                };
                (end, idx + 1)
            }),
        }
    }
}

/// The buffer filled up without a single delimiter in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("buffer of {capacity} bytes filled without a newline")]
pub struct Overflow {
    pub capacity: usize,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Overflow(#[from] Overflow),
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of a single [`FramedBuffer::read_from`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Data(usize),
    /// The other end closed (read returned 0).
    Closed,
    /// Nothing to read right now, try again after the next readiness event.
    WouldBlock,
}

#[derive(Debug)]
pub struct FramedBuffer {
    buf: Box<[u8]>,
    len: usize,
    // bytes before this offset are known to hold no delimiter
    searched: usize,
    newline: Newline,
}

impl FramedBuffer {
    /// # Panics
    /// If `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize, newline: Newline) -> Self {
        assert!(capacity > 0, "a framed buffer needs room for a delimiter");
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            searched: 0,
            newline,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of valid (not yet consumed) bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies as much of `bytes` as fits and returns how many were taken.
    ///
    /// Errors with [`Overflow`] when the buffer ends up full and holds no
    /// delimiter. The caller should drain frames with [`Self::take_frame`]
    /// before appending whatever was not accepted.
    pub fn append(&mut self, bytes: &[u8]) -> Result<usize, Overflow> {
        let n = bytes.len().min(self.capacity() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        self.check_overflow()?;
        Ok(n)
    }

    /// Appends all of `bytes`, handing every completed frame to `on_frame`
    /// as soon as it is complete.
    pub fn feed<F>(
        &mut self,
        mut bytes: &[u8],
        mut on_frame: F,
    ) -> Result<(), Overflow>
    where
        F: FnMut(Vec<u8>),
    {
        while !bytes.is_empty() {
            let taken = self.append(bytes)?;
            bytes = &bytes[taken..];
            while let Some(frame) = self.take_frame() {
                on_frame(frame);
            }
        }
        Ok(())
    }

    /// Does one read from `src` straight into the free space.
    ///
    /// Frames are not drained here; call [`Self::take_frame`] afterwards.
    pub fn read_from<R: Read + ?Sized>(
        &mut self,
        src: &mut R,
    ) -> Result<ReadStatus, FrameError> {
        // a full buffer here means the caller never drained it
        self.check_overflow()?;
        if self.len == self.capacity() {
            return Ok(ReadStatus::Data(0));
        }

        let n = loop {
            match src.read(&mut self.buf[self.len..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadStatus::WouldBlock);
                }
                Err(e) => return Err(e.into()),
            }
        };
        if n == 0 {
            return Ok(ReadStatus::Closed);
        }
        self.len += n;
        self.check_overflow()?;
        Ok(ReadStatus::Data(n))
    }

    /// Removes and returns the content before the first delimiter.
    pub fn take_frame(&mut self) -> Option<Vec<u8>> {
        let from = self.searched;
        let Some((end, next)) = self.newline.find(&self.buf[from..self.len])
        else {
            // a trailing '\r' may still pair with the next byte
            self.searched = self.len.saturating_sub(1);
            return None;
        };
        let (end, next) = (from + end, from + next);

        let frame = self.buf[..end].to_vec();
        self.consume(next);
        Some(frame)
    }

    /// Removes and returns pending bytes that never got a delimiter.
    pub fn take_remainder(&mut self) -> Option<Vec<u8>> {
        if self.len == 0 {
            return None;
        }
        let rest = self.buf[..self.len].to_vec();
        self.clear();
        Some(rest)
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.searched = 0;
    }

    fn consume(&mut self, n: usize) {
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
        self.searched = 0;
    }

    fn check_overflow(&self) -> Result<(), Overflow> {
        let full = self.len == self.capacity();
        if full && self.newline.find(&self.buf[..self.len]).is_none() {
            return Err(Overflow {
                capacity: self.capacity(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_frame_network() {
        let mut buf = FramedBuffer::new(32, Newline::Network);
        assert_eq!(buf.append(b"jobs\r\nkill 4").unwrap(), 12);
        assert_eq!(buf.take_frame().unwrap(), b"jobs");
        assert_eq!(buf.take_frame(), None);
        assert_eq!(buf.len(), 6);
        buf.append(b"2\r\n").unwrap();
        assert_eq!(buf.take_frame().unwrap(), b"kill 42");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bare_newline_is_not_a_network_delimiter() {
        let mut buf = FramedBuffer::new(32, Newline::Network);
        buf.append(b"jobs\nwatch 1\r\n").unwrap();
        assert_eq!(buf.take_frame().unwrap(), b"jobs\nwatch 1");
    }

    #[test]
    fn test_unix_strips_carriage_return() {
        let mut buf = FramedBuffer::new(32, Newline::Unix);
        buf.append(b"one\ntwo\r\n\nthree").unwrap();
        assert_eq!(buf.take_frame().unwrap(), b"one");
        assert_eq!(buf.take_frame().unwrap(), b"two");
        assert_eq!(buf.take_frame().unwrap(), b"");
        assert_eq!(buf.take_frame(), None);
        assert_eq!(buf.take_remainder().unwrap(), b"three");
        assert_eq!(buf.take_remainder(), None);
    }

    #[test]
    fn test_split_crlf_across_appends() {
        let mut buf = FramedBuffer::new(16, Newline::Network);
        buf.append(b"jobs\r").unwrap();
        assert_eq!(buf.take_frame(), None);
        buf.append(b"\n").unwrap();
        assert_eq!(buf.take_frame().unwrap(), b"jobs");
    }

    #[test]
    fn test_full_buffer_with_delimiter_is_not_overflow() {
        let mut buf = FramedBuffer::new(6, Newline::Network);
        assert_eq!(buf.append(b"jobs\r\nrun").unwrap(), 6);
        assert_eq!(buf.take_frame().unwrap(), b"jobs");
        assert_eq!(buf.append(b"run").unwrap(), 3);
    }

    #[test]
    fn test_overflow() {
        let mut buf = FramedBuffer::new(4, Newline::Unix);
        assert_eq!(buf.append(b"abc").unwrap(), 3);
        assert_eq!(buf.append(b"de"), Err(Overflow { capacity: 4 }));
    }

    #[test]
    fn test_read_from_reports_close() {
        let mut buf = FramedBuffer::new(8, Newline::Unix);
        let mut src: &[u8] = b"hi\n";
        assert_eq!(buf.read_from(&mut src).unwrap(), ReadStatus::Data(3));
        assert_eq!(buf.read_from(&mut src).unwrap(), ReadStatus::Closed);
        assert_eq!(buf.take_frame().unwrap(), b"hi");
    }

    #[test]
    fn test_read_from_overflow() {
        let mut buf = FramedBuffer::new(4, Newline::Network);
        let mut src: &[u8] = b"abcdefgh";
        assert!(matches!(
            buf.read_from(&mut src),
            Err(FrameError::Overflow(Overflow { capacity: 4 }))
        ));
    }
}
