use std::io::{self, Read};

/// Reader with a push-back buffer for sniffing headers.
///
/// Bytes returned by `peek` stay buffered and are handed out again by
/// `read`, so callers downstream see the stream from its first byte.
pub struct PeekReader<R> {
    inner: R,
    buffer: Vec<u8>,
    pos: usize,
}

impl<R: Read> PeekReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            pos: 0,
        }
    }

    /// Buffer up to `len` bytes without consuming them.
    ///
    /// Returns fewer than `len` bytes only at end of stream.
    pub fn peek(&mut self, len: usize) -> io::Result<&[u8]> {
        if self.pos > 0 {
            self.buffer.drain(..self.pos);
            self.pos = 0;
        }

        let mut chunk = [0u8; 8192];
        while self.buffer.len() < len {
            let want = (len - self.buffer.len()).min(chunk.len());
            match self.inner.read(&mut chunk[..want]) {
                Ok(0) => break,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(&self.buffer[..len.min(self.buffer.len())])
    }

    /// Bytes buffered but not yet read
    pub fn buffered(&self) -> &[u8] {
        &self.buffer[self.pos..]
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: Read> Read for PeekReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pending = &self.buffer[self.pos..];
        if !pending.is_empty() {
            let to_copy = pending.len().min(buf.len());
            buf[..to_copy].copy_from_slice(&pending[..to_copy]);
            self.pos += to_copy;
            if self.pos == self.buffer.len() {
                // Release the sniff buffer once drained
                self.buffer = Vec::new();
                self.pos = 0;
            }
            return Ok(to_copy);
        }
        self.inner.read(buf)
    }
}
