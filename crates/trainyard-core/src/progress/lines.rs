//! Incremental line splitting over arbitrarily chunked output.

/// Default cap on an unterminated fragment.
pub const DEFAULT_MAX_PENDING_BYTES: usize = 64 * 1024;

/// Reassembles complete lines from raw output chunks.
///
/// Chunks need not be newline-aligned. A trailing fragment is held back
/// until its `\n` arrives (a preceding `\r` is stripped), or until
/// [`LineSplitter::finish`] is called at end of stream.
///
/// The fragment is capped: past the limit its oldest bytes are dropped, so
/// output that never ends a line (`\r`-redrawn progress bars) keeps only
/// its most recent text.
#[derive(Debug)]
pub struct LineSplitter {
    pending: String,
    max_pending: usize,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_PENDING_BYTES)
    }
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn with_limit(max_pending: usize) -> Self {
        Self {
            pending: String::new(),
            max_pending,
        }
    }

    /// Feed a chunk, returning every line it completed, in order.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);

        let lines = match self.pending.rfind('\n') {
            Some(last_newline) => {
                let rest = self.pending.split_off(last_newline + 1);
                let complete = std::mem::replace(&mut self.pending, rest);
                complete
                    .split_terminator('\n')
                    .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
                    .collect()
            }
            None => Vec::new(),
        };
        self.trim_pending();
        lines
    }

    fn trim_pending(&mut self) {
        if self.pending.len() <= self.max_pending {
            return;
        }
        let mut cut = self.pending.len() - self.max_pending;
        while !self.pending.is_char_boundary(cut) {
            cut += 1;
        }
        self.pending.drain(..cut);
    }

    /// Bytes currently held back waiting for a line terminator.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// End of stream: return the unterminated fragment, if any.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.strip_suffix('\r').unwrap_or(&rest);
        (!rest.is_empty()).then(|| rest.to_string())
    }
}
