//! Newline-delimited framing for the server output stream.
//!
//! Bytes are appended as they arrive; complete lines are pulled out one at a
//! time and any trailing partial line stays buffered for the next chunk.

/// Accumulates raw output bytes and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Bytes before this offset are known to contain no newline.
    scanned: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from the stream.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pull the next complete, non-blank line (without its terminator).
    ///
    /// Returns `None` when only a partial line (or nothing) is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let offset = self.buf[self.scanned..].iter().position(|b| *b == b'\n');
            let Some(offset) = offset else {
                self.scanned = self.buf.len();
                return None;
            };
            let end = self.scanned + offset;
            let raw: Vec<u8> = self.buf.drain(..=end).collect();
            self.scanned = 0;

            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim();
            if !line.is_empty() {
                return Some(line.to_string());
            }
        }
    }

    /// Iterate over every complete line currently buffered.
    pub fn lines(&mut self) -> Lines<'_> {
        Lines { buffer: self }
    }

    /// Flush the trailing partial line, used once the stream has ended.
    pub fn take_remainder(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buf);
        self.scanned = 0;
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim();
        (!line.is_empty()).then(|| line.to_string())
    }

    /// Number of buffered bytes not yet returned as a line.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

/// Pull-style iterator over complete lines; see [`LineBuffer::lines`].
pub struct Lines<'a> {
    buffer: &'a mut LineBuffer,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.buffer.next_line()
    }
}
