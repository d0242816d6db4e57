//! Byte-stream framing: arbitrary chunks from the serial port (or a G-code
//! input source) split into complete text lines.
//!
//! The splitter keeps the trailing, possibly incomplete fragment between
//! chunks, treats any run of CR/LF bytes as a single delimiter, drops blank
//! or all-whitespace lines, and strips stray XON/XOFF control characters
//! that make it through the stream.

/// XON control byte occasionally leaked by the device into line data.
const XON: char = '\u{11}';
/// XOFF control byte occasionally leaked by the device into line data.
const XOFF: char = '\u{13}';

/// Incremental line splitter with a partial-line carry buffer.
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: String,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of bytes and return every line completed by it.
    ///
    /// Invalid UTF-8 is replaced rather than rejected; the device speaks
    /// ASCII and a mangled byte should cost at most one line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.partial.push_str(&String::from_utf8_lossy(bytes));

        let buffer = std::mem::take(&mut self.partial);
        let mut rest = buffer.as_str();
        let mut lines = Vec::new();

        while let Some(pos) = rest.find(['\r', '\n']) {
            let (line, tail) = rest.split_at(pos);
            if let Some(clean) = Self::clean(line) {
                lines.push(clean);
            }
            rest = tail.trim_start_matches(['\r', '\n']);
        }

        // Whatever follows the last delimiter waits for the next chunk.
        self.partial = rest.to_string();
        lines
    }

    /// Flush the retained fragment as a final line, if it has content.
    ///
    /// Used at end-of-input when the source does not end with a newline.
    pub fn flush(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.partial);
        Self::clean(&tail)
    }

    fn clean(line: &str) -> Option<String> {
        let cleaned: String = line.chars().filter(|c| *c != XON && *c != XOFF).collect();
        if cleaned.trim().is_empty() {
            None
        } else {
            Some(cleaned)
        }
    }
}
