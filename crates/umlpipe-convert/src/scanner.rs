//! Delimiter scanning over byte streams.
//!
//! [`DelimiterScanner`] finds the first occurrence of a delimiter in a byte
//! stream while holding back at most `delimiter.len()` bytes. The copy
//! drivers ([`copy_until`], [`copy_until_async`]) feed it one byte per read,
//! so no byte after the delimiter is ever taken from the input. That matters
//! for engine pipes, where the bytes after one delimiter belong to the next
//! conversion.

use std::io::{self, Read, Write};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Outcome of feeding one byte to a [`DelimiterScanner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// Byte was buffered; nothing to emit yet.
    Pending,
    /// Oldest buffered byte can no longer start a delimiter and is released.
    Flush(u8),
    /// The buffered bytes are exactly the delimiter.
    Delimiter,
}

/// Result of a delimited copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Copied {
    /// Bytes written to the output (never includes delimiter bytes).
    pub bytes: u64,
    /// Whether the copy stopped at the delimiter rather than end of input.
    pub delimited: bool,
}

/// Incremental delimiter matcher over a ring buffer sized to the delimiter.
#[derive(Debug)]
pub struct DelimiterScanner<'d> {
    delimiter: &'d [u8],
    buffer: Vec<u8>,
    read: usize,
    write: usize,
    len: usize,
}

impl<'d> DelimiterScanner<'d> {
    /// Create a scanner for `delimiter`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the delimiter is empty.
    pub fn new(delimiter: &'d [u8]) -> io::Result<Self> {
        if delimiter.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "delimiter must not be empty",
            ));
        }
        Ok(Self {
            delimiter,
            buffer: vec![0; delimiter.len()],
            read: 0,
            write: 0,
            len: 0,
        })
    }

    fn advance(&self, i: usize) -> usize {
        (i + 1) % self.buffer.len()
    }

    /// Feed the next input byte.
    pub fn push(&mut self, byte: u8) -> Scan {
        self.buffer[self.write] = byte;
        self.write = self.advance(self.write);
        self.len += 1;

        if self.is_delimiter() {
            return Scan::Delimiter;
        }
        if self.len < self.buffer.len() {
            return Scan::Pending;
        }

        let oldest = self.buffer[self.read];
        self.read = self.advance(self.read);
        self.len -= 1;
        Scan::Flush(oldest)
    }

    /// Walk the buffered bytes from the read cursor against the delimiter.
    ///
    /// Stops as soon as a byte differs or the next byte has not been written
    /// yet, so only a full-length match counts.
    fn is_delimiter(&self) -> bool {
        let mut i = self.read;
        for (seen, &expected) in self.delimiter.iter().enumerate() {
            if seen == self.len || self.buffer[i] != expected {
                return false;
            }
            i = self.advance(i);
        }
        true
    }

    /// Consume the scanner, returning the bytes still held back, oldest first.
    pub fn finish(self) -> Vec<u8> {
        (0..self.len)
            .map(|k| self.buffer[(self.read + k) % self.buffer.len()])
            .collect()
    }
}

/// Copy `input` to `output` until `delimiter` is read or input ends.
///
/// The delimiter itself is consumed but not written. End of input is a
/// normal return with [`Copied::delimited`] set to `false`; callers that need
/// the delimiter must check it.
pub fn copy_until<R, W>(input: &mut R, delimiter: &[u8], output: &mut W) -> io::Result<Copied>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut scanner = DelimiterScanner::new(delimiter)?;
    let mut bytes = 0u64;
    let mut byte = [0u8; 1];

    loop {
        match input.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        match scanner.push(byte[0]) {
            Scan::Pending => {}
            Scan::Flush(b) => {
                output.write_all(&[b])?;
                bytes += 1;
            }
            Scan::Delimiter => {
                return Ok(Copied {
                    bytes,
                    delimited: true,
                });
            }
        }
    }

    let rest = scanner.finish();
    output.write_all(&rest)?;
    bytes += rest.len() as u64;
    Ok(Copied {
        bytes,
        delimited: false,
    })
}

/// Async counterpart of [`copy_until`].
pub async fn copy_until_async<R, W>(
    input: &mut R,
    delimiter: &[u8],
    output: &mut W,
) -> io::Result<Copied>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut scanner = DelimiterScanner::new(delimiter)?;
    let mut bytes = 0u64;
    let mut byte = [0u8; 1];

    loop {
        if input.read(&mut byte).await? == 0 {
            break;
        }
        match scanner.push(byte[0]) {
            Scan::Pending => {}
            Scan::Flush(b) => {
                output.write_all(&[b]).await?;
                bytes += 1;
            }
            Scan::Delimiter => {
                return Ok(Copied {
                    bytes,
                    delimited: true,
                });
            }
        }
    }

    let rest = scanner.finish();
    output.write_all(&rest).await?;
    bytes += rest.len() as u64;
    Ok(Copied {
        bytes,
        delimited: false,
    })
}
