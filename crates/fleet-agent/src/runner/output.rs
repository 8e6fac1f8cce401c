pub(crate) const TRUNCATED_MARKER: &str = "\n[output truncated]";

/// Bounded copy of everything relayed for one command.
#[derive(Debug)]
pub(crate) struct OutputAccumulator {
    buffer: String,
    max_bytes: usize,
    truncated: bool,
}

impl OutputAccumulator {
    pub(crate) fn new(max_bytes: usize) -> Self {
        Self {
            buffer: String::new(),
            max_bytes,
            truncated: false,
        }
    }

    pub(crate) fn push(&mut self, chunk: &str) {
        if self.truncated {
            return;
        }
        let remaining = self.max_bytes.saturating_sub(self.buffer.len());
        if chunk.len() <= remaining {
            self.buffer.push_str(chunk);
            return;
        }
        let mut cut = remaining;
        while !chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        self.buffer.push_str(&chunk[..cut]);
        self.truncated = true;
    }

    pub(crate) fn finish(mut self) -> String {
        if self.truncated {
            self.buffer.push_str(TRUNCATED_MARKER);
        }
        self.buffer
    }
}

/// Appends `line` so that it starts on its own line.
pub(crate) fn append_line(output: &mut String, line: &str) {
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(line);
}
