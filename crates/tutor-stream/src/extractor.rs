//! Pulls complete JSON candidates out of a growing text buffer.
//!
//! Two producer styles are supported: one value per line (NDJSON, optionally
//! framed as SSE `data:` lines) and free-form text where values are found by
//! brace balancing. Whatever is not yet complete stays buffered for the next
//! chunk.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default upper bound for unconsumed buffered text.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 128 * 1024;

const OVERFLOW_PREVIEW_CHARS: usize = 200;
const SSE_IGNORED_FIELDS: [&str; 3] = ["event:", "id:", "retry:"];
const DONE_SENTINEL: &str = "[DONE]";

/// How candidates are delimited in the buffered text.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractStrategy {
    /// Split on `\n`; each complete line is one candidate.
    #[default]
    Lines,
    /// Track `{`/`}` nesting and cut out each balanced object.
    Braces,
}

impl ExtractStrategy {
    /// Chooses a strategy from a response `Content-Type` header value.
    pub fn for_content_type(content_type: &str) -> Self {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "application/x-ndjson" | "application/ndjson" | "application/jsonl"
            | "text/event-stream" => Self::Lines,
            _ => Self::Braces,
        }
    }
}

/// One unit handed to the classifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Candidate {
    /// Text that should hold exactly one JSON value.
    Json(String),
    /// Leading text of a buffer that was dropped after outgrowing the bound.
    /// The rest of that oversized value is skipped as it arrives.
    Overflow(String),
}

#[derive(Debug, Default)]
struct BraceScan {
    active: bool,
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

/// Buffered candidate extractor owned by a single stream.
#[derive(Debug)]
pub struct Extractor {
    strategy: ExtractStrategy,
    buffer: String,
    max_buffer_bytes: usize,
    scan: BraceScan,
    /// Discarding the tail of a value that overflowed the buffer.
    skipping: bool,
}

impl Extractor {
    pub fn new(strategy: ExtractStrategy) -> Self {
        Self::with_max_buffer(strategy, DEFAULT_MAX_BUFFER_BYTES)
    }

    pub fn with_max_buffer(strategy: ExtractStrategy, max_buffer_bytes: usize) -> Self {
        Self {
            strategy,
            buffer: String::new(),
            max_buffer_bytes: max_buffer_bytes.max(1),
            scan: BraceScan::default(),
            skipping: false,
        }
    }

    pub fn strategy(&self) -> ExtractStrategy {
        self.strategy
    }

    /// Bytes of text currently held back.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Appends decoded text and returns every candidate it completes.
    pub fn push(&mut self, text: &str) -> Vec<Candidate> {
        self.buffer.push_str(text);
        self.extract()
    }

    /// Extracts complete candidates from what is already buffered.
    ///
    /// Calling this again without new input yields nothing.
    pub fn extract(&mut self) -> Vec<Candidate> {
        let mut out = Vec::new();
        match self.strategy {
            ExtractStrategy::Lines => self.extract_lines(&mut out),
            ExtractStrategy::Braces => self.extract_objects(&mut out),
        }
        if self.buffer.len() > self.max_buffer_bytes {
            let preview = self.buffer.chars().take(OVERFLOW_PREVIEW_CHARS).collect();
            warn!(
                event = "stream.buffer_overflow",
                domain = "stream",
                buffered = self.buffer.len() as u64,
                limit = self.max_buffer_bytes as u64,
                "dropping unterminated buffer"
            );
            self.buffer.clear();
            // Keep the brace scan state so the tail is recognized as part of
            // the dropped value, not as a fresh object.
            self.scan.pos = 0;
            self.skipping = true;
            out.push(Candidate::Overflow(preview));
        }
        out
    }

    /// Drains the buffer at end of stream.
    ///
    /// An unterminated last line is still a candidate; an unbalanced object
    /// tail never completed and is dropped.
    pub fn finish(&mut self) -> Vec<Candidate> {
        let mut out = self.extract();
        if self.strategy == ExtractStrategy::Lines
            && let Some(line) = clean_line(&self.buffer)
        {
            out.push(Candidate::Json(line.to_string()));
        }
        self.reset();
        out
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.scan = BraceScan::default();
        self.skipping = false;
    }

    fn extract_lines(&mut self, out: &mut Vec<Candidate>) {
        if self.skipping {
            match self.buffer.find('\n') {
                Some(newline) => {
                    self.buffer.drain(..=newline);
                    self.skipping = false;
                }
                None => {
                    self.buffer.clear();
                    return;
                }
            }
        }
        let Some(last_newline) = self.buffer.rfind('\n') else {
            return;
        };
        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);
        out.extend(
            complete
                .split('\n')
                .filter_map(clean_line)
                .map(|line| Candidate::Json(line.to_string())),
        );
    }

    fn extract_objects(&mut self, out: &mut Vec<Candidate>) {
        loop {
            if !self.scan.active {
                match self.buffer.find('{') {
                    Some(start) => {
                        self.buffer.drain(..start);
                        self.scan = BraceScan {
                            active: true,
                            ..BraceScan::default()
                        };
                    }
                    None => {
                        self.buffer.clear();
                        return;
                    }
                }
            }

            // Structural bytes are ASCII, so a byte scan never splits a char.
            let bytes = self.buffer.as_bytes();
            let scan = &mut self.scan;
            let mut end = None;
            while scan.pos < bytes.len() {
                let byte = bytes[scan.pos];
                scan.pos += 1;
                if scan.in_string {
                    if scan.escaped {
                        scan.escaped = false;
                    } else if byte == b'\\' {
                        scan.escaped = true;
                    } else if byte == b'"' {
                        scan.in_string = false;
                    }
                    continue;
                }
                match byte {
                    b'"' => scan.in_string = true,
                    b'{' => scan.depth += 1,
                    b'}' => {
                        scan.depth = scan.depth.saturating_sub(1);
                        if scan.depth == 0 {
                            end = Some(scan.pos);
                            break;
                        }
                    }
                    _ => {}
                }
            }

            let Some(end) = end else {
                if self.skipping {
                    self.buffer.clear();
                    self.scan.pos = 0;
                }
                return;
            };
            let object: String = self.buffer.drain(..end).collect();
            self.scan = BraceScan::default();
            if self.skipping {
                self.skipping = false;
                continue;
            }
            out.push(Candidate::Json(object));
        }
    }
}

/// Normalizes one NDJSON/SSE line; `None` means there is nothing to parse.
fn clean_line(raw: &str) -> Option<&str> {
    let mut line = raw.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    if let Some(data) = line.strip_prefix("data:") {
        line = data.trim();
    } else if SSE_IGNORED_FIELDS
        .iter()
        .any(|field| line.starts_with(field))
    {
        return None;
    }
    let line = strip_code_fence(line);
    if line.is_empty() || line == DONE_SENTINEL {
        return None;
    }
    Some(line)
}

/// Removes a leading ```` ```lang ```` marker and a trailing ```` ``` ````.
pub(crate) fn strip_code_fence(text: &str) -> &str {
    let mut text = text.trim();
    if let Some(rest) = text.strip_prefix("```") {
        text = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim()
}
