//! Output buffer with ANSI stripping and tail-only prompt search.
//!
//! Only the last `search_depth` bytes are searched for the prompt, so large
//! outputs (a full running configuration) do not make every read quadratic.

use bytes::BytesMut;
use regex::bytes::Regex;
use vte::{Parser, Perform};

/// Accumulates session output until a prompt is seen.
pub struct PromptBuffer {
    data: BytesMut,
    parser: Parser,
    search_depth: usize,
}

/// Collects printable text and line control characters, dropping escapes.
struct Printable<'a> {
    out: &'a mut BytesMut,
}

impl Perform for Printable<'_> {
    fn print(&mut self, c: char) {
        let mut utf8 = [0u8; 4];
        self.out.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
    }

    fn execute(&mut self, byte: u8) {
        if matches!(byte, b'\n' | b'\r' | b'\t') {
            self.out.extend_from_slice(&[byte]);
        }
    }
}

impl PromptBuffer {
    /// Create a buffer searching the last `search_depth` bytes for prompts.
    pub fn new(search_depth: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(4096),
            parser: Parser::new(),
            search_depth,
        }
    }

    /// Append raw session bytes, stripping terminal escape sequences.
    pub fn extend(&mut self, chunk: &[u8]) {
        let mut sink = Printable {
            out: &mut self.data,
        };
        self.parser.advance(&mut sink, chunk);
    }

    /// Find a prompt that ends the buffered output.
    ///
    /// Returns the absolute end offset of the prompt. A match followed by
    /// anything but whitespace is not a prompt yet.
    pub fn find_prompt(&self, prompt: &Regex) -> Option<usize> {
        let start = self.data.len().saturating_sub(self.search_depth);
        let tail = &self.data[start..];
        let m = prompt.find_iter(tail).last()?;
        if tail[m.end()..].iter().all(u8::is_ascii_whitespace) {
            Some(start + m.end())
        } else {
            None
        }
    }

    /// Remove and return everything up to `end`.
    pub fn split_through(&mut self, end: usize) -> Vec<u8> {
        let taken = self.data.split_to(end.min(self.data.len())).to_vec();
        // Whatever trailed the prompt was only whitespace
        self.data.clear();
        taken
    }

    /// Current buffered length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for PromptBuffer {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ansi_stripping() {
        let mut buffer = PromptBuffer::new(100);
        buffer.extend(b"\x1b[32mrouter#\x1b[0m");
        assert_eq!(buffer.split_through(buffer.len()), b"router#");
    }

    #[test]
    fn test_prompt_at_end() {
        let prompt = Regex::new(r"(?m)^[\w.\-]+#\s?$").unwrap();
        let mut buffer = PromptBuffer::new(100);
        buffer.extend(b"show clock\r\n10:00:00 UTC\r\nrouter#");

        let end = buffer.find_prompt(&prompt).unwrap();
        let out = buffer.split_through(end);
        assert!(out.ends_with(b"router#"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_prompt_must_end_output() {
        let prompt = Regex::new(r"(?m)^[\w.\-]+#\s?$").unwrap();
        let mut buffer = PromptBuffer::new(100);
        buffer.extend(b"router#\r\nmore output still arriving");
        assert!(buffer.find_prompt(&prompt).is_none());

        buffer.extend(b"\r\nrouter# ");
        assert!(buffer.find_prompt(&prompt).is_some());
    }

    #[test]
    fn test_prompt_outside_search_depth() {
        let prompt = Regex::new(r"router#").unwrap();
        let mut buffer = PromptBuffer::new(10);
        buffer.extend(b"router#");
        buffer.extend(&[b'x'; 100]);
        assert!(buffer.find_prompt(&prompt).is_none());
    }

    #[test]
    fn test_split_across_chunks() {
        let prompt = Regex::new(r"(?m)^sw1>\s?$").unwrap();
        let mut buffer = PromptBuffer::new(100);
        buffer.extend(b"\x1b[1");
        buffer.extend(b"msw1");
        assert!(buffer.find_prompt(&prompt).is_none());
        buffer.extend(b">");
        assert!(buffer.find_prompt(&prompt).is_some());
    }
}
