//! Transparency for the DATA phase (RFC 5321 section 4.5.2).

use std::io::{self, Write};

/// A writer that dot-stuffs and normalises line endings as bytes pass
/// through.
///
/// Every line starting with `.` gains an extra `.`, and bare CR or LF
/// become CRLF. Call [`finish`](Self::finish) to terminate the last line;
/// the end-of-data marker itself is left to the caller.
#[derive(Debug)]
pub struct DotStuffer<W> {
    inner: W,
    at_line_start: bool,
    pending_cr: bool,
    written: bool,
}

impl<W: Write> DotStuffer<W> {
    pub const fn new(inner: W) -> Self {
        Self {
            inner,
            at_line_start: true,
            pending_cr: false,
            written: false,
        }
    }

    /// Closes the final line with CRLF if needed and returns the inner writer.
    ///
    /// # Errors
    ///
    /// Propagates write errors from the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        if self.pending_cr {
            self.inner.write_all(b"\n")?;
        } else if self.written && !self.at_line_start {
            self.inner.write_all(b"\r\n")?;
        }
        Ok(self.inner)
    }
}

impl<W: Write> Write for DotStuffer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = Vec::with_capacity(buf.len() + buf.len() / 64 + 2);

        for &byte in buf {
            if self.pending_cr {
                self.pending_cr = false;
                out.push(b'\n');
                self.at_line_start = true;
                if byte == b'\n' {
                    continue;
                }
            }

            match byte {
                b'\r' => {
                    out.push(b'\r');
                    self.pending_cr = true;
                }
                b'\n' => {
                    out.extend_from_slice(b"\r\n");
                    self.at_line_start = true;
                }
                b'.' if self.at_line_start => {
                    out.extend_from_slice(b"..");
                    self.at_line_start = false;
                }
                _ => {
                    out.push(byte);
                    self.at_line_start = false;
                }
            }
        }

        self.written |= !buf.is_empty();
        self.inner.write_all(&out)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
