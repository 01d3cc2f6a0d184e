//! Newline framing for the server's stdout.
//!
//! [`LineFramer`] turns a byte stream into a lazy sequence of parsed JSON
//! values, one per line. Blank lines are skipped. Lines that are not valid
//! UTF-8 JSON (startup banners, stray log output) are dropped and counted, as
//! are lines longer than the framer's limit.

use std::io::{BufRead, BufReader, ErrorKind, Read};

use serde_json::Value;

/// How much of a dropped line to include in log output.
const LOG_PREVIEW_CHARS: usize = 120;

/// Longest line accepted by default, excluding the newline.
pub const DEFAULT_MAX_LINE_LEN: usize = 16 * 1024 * 1024;

/// Outcome of reading one raw line.
enum Fill {
    Line,
    Oversized,
    End,
}

/// Lazy, non-restartable sequence of JSON messages read from a byte stream.
///
/// Ends when the underlying stream reaches EOF or fails. Bytes of an
/// unterminated line are held until its newline arrives; a final line with
/// no terminator is still parsed at EOF.
pub struct LineFramer<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    max_line_len: usize,
    malformed: u64,
    done: bool,
}

impl<R: Read> LineFramer<R> {
    /// Wrap a byte stream, accepting lines up to [`DEFAULT_MAX_LINE_LEN`].
    pub fn new(inner: R) -> Self {
        Self::with_max_line_len(inner, DEFAULT_MAX_LINE_LEN)
    }

    /// Wrap a byte stream, dropping any line longer than `max_line_len` bytes.
    pub fn with_max_line_len(inner: R, max_line_len: usize) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::with_capacity(4096_usize.min(max_line_len.saturating_add(1))),
            max_line_len,
            malformed: 0,
            done: false,
        }
    }

    /// Number of lines dropped because they were not valid JSON or too long.
    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }

    /// Read the next raw line into `self.buf`, holding at most the limit plus
    /// its newline.
    fn fill_line(&mut self) -> Fill {
        self.buf.clear();
        loop {
            let room = self.max_line_len.saturating_add(1).saturating_sub(self.buf.len()) as u64;
            match (&mut self.reader).take(room).read_until(b'\n', &mut self.buf) {
                Ok(_) if self.buf.ends_with(b"\n") => return Fill::Line,
                Ok(_) if self.buf.len() > self.max_line_len => return Fill::Oversized,
                Ok(0) if self.buf.is_empty() => return Fill::End,
                // Unterminated final line.
                Ok(0) => return Fill::Line,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "read from server stdout failed");
                    return Fill::End;
                }
            }
        }
    }

    /// Discard input up to and including the next newline. Returns false if
    /// the stream ended first.
    fn skip_rest_of_line(&mut self) -> bool {
        loop {
            let (consumed, found) = match self.reader.fill_buf() {
                Ok([]) => return false,
                Ok(available) => match available.iter().position(|&b| b == b'\n') {
                    Some(i) => (i + 1, true),
                    None => (available.len(), false),
                },
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "read from server stdout failed");
                    return false;
                }
            };
            self.reader.consume(consumed);
            if found {
                return true;
            }
        }
    }

    fn parse_line(&mut self) -> Option<Value> {
        let line = trim_line_ending(&self.buf);
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }

        match serde_json::from_slice(line) {
            Ok(value) => Some(value),
            Err(e) => {
                self.malformed += 1;
                let preview: String = String::from_utf8_lossy(line)
                    .chars()
                    .take(LOG_PREVIEW_CHARS)
                    .collect();
                tracing::debug!(error = %e, line = %preview, "dropping non-JSON line");
                None
            }
        }
    }
}

impl<R: Read> Iterator for LineFramer<R> {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        while !self.done {
            match self.fill_line() {
                Fill::End => self.done = true,
                Fill::Oversized => {
                    self.malformed += 1;
                    tracing::warn!(
                        limit = self.max_line_len,
                        "dropping over-long line from server"
                    );
                    self.buf.clear();
                    if !self.skip_rest_of_line() {
                        self.done = true;
                    }
                }
                Fill::Line => {
                    if let Some(value) = self.parse_line() {
                        return Some(value);
                    }
                }
            }
        }
        None
    }
}

/// Build a framer over `reader`.
pub fn frames<R: Read>(reader: R) -> LineFramer<R> {
    LineFramer::new(reader)
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
