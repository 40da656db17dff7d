//! Incremental newline framing for subprocess output.
//!
//! Output arrives in arbitrary chunks. The framer keeps the trailing partial
//! line back until its newline shows up, so callers only ever see complete
//! records. Framing is done on bytes, which keeps a multi-byte character split
//! across two reads intact.

/// Accumulates raw output and yields complete newline-terminated lines.
#[derive(Debug, Default, Clone)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every line it completed, in order.
    ///
    /// The newline itself is not part of the returned line. Whatever follows
    /// the last newline stays buffered.
    pub fn feed(&mut self, chunk: impl AsRef<[u8]>) -> Vec<String> {
        self.buffer.extend_from_slice(chunk.as_ref());

        let Some(last_newline) = self.buffer.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        complete[..last_newline]
            .split(|&b| b == b'\n')
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    /// The buffered partial line.
    pub fn pending(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }

    /// Drains the buffered partial line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Pure form of [`LineFramer::feed`]: `(leftover, chunk) -> (lines, leftover)`.
pub fn split_lines(buffer: &str, chunk: &str) -> (Vec<String>, String) {
    let joined = format!("{buffer}{chunk}");
    let mut parts: Vec<String> = joined.split('\n').map(str::to_string).collect();
    let leftover = parts.pop().unwrap_or_default();
    (parts, leftover)
}
