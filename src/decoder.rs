//! Line-protocol decoder
//!
//! Turns the chat endpoint's byte stream into content deltas. Each line of
//! the body is one of:
//! - `0:"<json string>"`: a content delta
//! - a blank line
//! - the end-of-stream sentinel (`data: [DONE]`)
//! - anything else, taken verbatim as text (plain-text server mode)
//!
//! Bytes are buffered before UTF-8 decoding, so chunk boundaries may fall
//! anywhere, including inside a multi-byte character.

#[cfg(test)]
mod proptests;

pub const CONTENT_PREFIX: &str = "0:";

const SENTINELS: [&str; 2] = ["data: [DONE]", "[DONE]"];

/// Classification of one complete line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    /// Content record with its decoded payload
    Content(String),
    /// Unprefixed text, used as-is
    Raw(String),
    Sentinel,
    Blank,
    /// Content record whose payload failed to parse
    Malformed { line: String, reason: String },
}

impl ParsedLine {
    pub fn parse(line: &str) -> Self {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let trimmed = line.trim();

        if trimmed.is_empty() {
            return ParsedLine::Blank;
        }
        if SENTINELS.contains(&trimmed) {
            return ParsedLine::Sentinel;
        }

        let Some(payload) = line.strip_prefix(CONTENT_PREFIX) else {
            return ParsedLine::Raw(line.to_string());
        };

        if payload.trim_start().starts_with('"') {
            match serde_json::from_str::<String>(payload) {
                Ok(text) => ParsedLine::Content(text),
                Err(e) => ParsedLine::Malformed {
                    line: line.to_string(),
                    reason: e.to_string(),
                },
            }
        } else {
            // Prefixed but not a string literal: keep the payload as text
            ParsedLine::Raw(payload.to_string())
        }
    }

    /// Text this line contributes to the message, if any
    pub fn into_delta(self) -> Option<String> {
        match self {
            ParsedLine::Content(text) | ParsedLine::Raw(text) => Some(text),
            ParsedLine::Sentinel | ParsedLine::Blank | ParsedLine::Malformed { .. } => None,
        }
    }
}

/// Incremental decoder for one stream attempt
#[derive(Debug, Default)]
pub struct LineDecoder {
    /// Bytes of the trailing line not yet terminated by `\n`
    carry: Vec<u8>,
    malformed: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk; returns the deltas of every line it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.carry.extend_from_slice(chunk);

        let mut deltas = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.carry[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.carry[start..end]).into_owned();
            self.process_line(&line, &mut deltas);
            start = end + 1;
        }
        self.carry.drain(..start);

        deltas
    }

    /// Flush an unterminated final line at end of stream
    pub fn finish(&mut self) -> Vec<String> {
        let mut deltas = Vec::new();
        if !self.carry.is_empty() {
            let rest = std::mem::take(&mut self.carry);
            let line = String::from_utf8_lossy(&rest).into_owned();
            self.process_line(&line, &mut deltas);
        }
        deltas
    }

    /// Number of malformed content records skipped so far
    pub fn malformed_count(&self) -> usize {
        self.malformed
    }

    fn process_line(&mut self, line: &str, deltas: &mut Vec<String>) {
        match ParsedLine::parse(line) {
            ParsedLine::Malformed { line, reason } => {
                self.malformed += 1;
                tracing::warn!(line = %line, reason = %reason, "Skipping malformed content line");
            }
            ParsedLine::Sentinel => {
                tracing::trace!("End-of-stream sentinel");
            }
            parsed => {
                if let Some(delta) = parsed.into_delta() {
                    deltas.push(delta);
                }
            }
        }
    }
}

/// Decode a complete body in one pass
#[cfg(test)]
pub fn decode_all(body: &[u8]) -> Vec<String> {
    let mut decoder = LineDecoder::new();
    let mut deltas = decoder.feed(body);
    deltas.extend(decoder.finish());
    deltas
}
