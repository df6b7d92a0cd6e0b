//! Bounded output history kept for the final report and audit entry.

/// Accumulates text up to a byte limit; anything beyond is dropped and the
/// buffer is marked truncated.
#[derive(Debug, Clone)]
pub struct BoundedOutput {
    text: String,
    limit: usize,
    truncated: bool,
}

impl BoundedOutput {
    pub const fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        if self.truncated {
            return;
        }
        let room = self.limit.saturating_sub(self.text.len());
        if chunk.len() <= room {
            self.text.push_str(chunk);
            return;
        }
        let mut cut = room;
        while !chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&chunk[..cut]);
        self.truncated = true;
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub const fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_string(self) -> String {
        self.text
    }

    /// The last `max_bytes` of the history, on a char boundary.
    pub fn tail(&self, max_bytes: usize) -> &str {
        if self.text.len() <= max_bytes {
            return &self.text;
        }
        let mut start = self.text.len() - max_bytes;
        while !self.text.is_char_boundary(start) {
            start += 1;
        }
        &self.text[start..]
    }
}
