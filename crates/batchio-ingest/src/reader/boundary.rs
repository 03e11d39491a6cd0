//! Record boundary detection for structured text
//!
//! A detector pulls raw record texts out of a byte stream. It knows nothing
//! about fragments beyond the `limit` it is handed: a record whose first byte
//! lies before `limit` is completed even if that means reading past it, and no
//! record is started once the stream position has reached `limit`.

use batchio_common::Result;
use std::io::BufRead;
use tracing::debug;

/// Raw text of one record and where it sits in the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub text: Vec<u8>,
    /// Offset of the first byte, relative to where the stream was opened
    pub start: u64,
}

pub trait BoundaryDetector {
    /// Next raw record starting before `limit`, or `None` at end of stream
    fn next_raw(&mut self, limit: u64) -> Result<Option<RawRecord>>;

    /// Bytes read from the stream so far
    fn bytes_consumed(&self) -> u64;
}

enum Feed {
    Continue,
    Stop,
    Emit(RawRecord),
}

#[derive(Debug, Clone, Copy)]
struct OpenObject {
    /// Index of the opening brace in `buf`
    index: usize,
    has_identifier: bool,
    /// Never emitted: an enclosed record was, or the object began inside a
    /// record owned by an earlier stream
    spent: bool,
}

/// What the scanner knows about the nesting level it started at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    /// Started at the beginning of a document
    Settled,
    /// Started mid-file; a record closing at the starting level is held until
    /// the next structural byte shows whether it was nested in something older
    Unknown,
    /// Inside an object that began before the stream; nothing is emitted until
    /// its closing brace
    Foreign,
}

/// Byte-at-a-time JSON state, kept apart from the reader so the two can be
/// borrowed independently while a chunk is scanned.
struct JsonScanner {
    identifier: Vec<u8>,
    level: Level,

    in_string: bool,
    escaped: bool,
    /// Leading bytes of the current string, enough to compare with the identifier
    string_head: Vec<u8>,
    string_too_long: bool,
    key_pending: bool,

    stack: Vec<OpenObject>,
    buf: Vec<u8>,
    buf_origin: u64,
    /// Record awaiting confirmation that it sits at the top level
    held: Option<RawRecord>,
}

impl JsonScanner {
    fn new(identifier: &str, level: Level) -> Self {
        Self {
            identifier: identifier.as_bytes().to_vec(),
            level,
            in_string: false,
            escaped: false,
            string_head: Vec::new(),
            string_too_long: false,
            key_pending: false,
            stack: Vec::new(),
            buf: Vec::new(),
            buf_origin: 0,
            held: None,
        }
    }

    fn buffering(&self) -> bool {
        self.stack.iter().any(|o| !o.spent)
    }

    /// Stream offset of the outermost object that could still become a record
    fn earliest_live_start(&self) -> Option<u64> {
        self.stack
            .iter()
            .find(|o| !o.spent)
            .map(|o| self.buf_origin + o.index as u64)
    }

    /// Apply the limit rule, then scan `byte`
    fn feed(&mut self, byte: u8, offset: u64, limit: u64) -> Feed {
        // a held record still needs the byte that confirms it, wherever it lies
        if offset >= limit
            && self.held.is_none()
            && self.earliest_live_start().is_none_or(|start| start >= limit)
        {
            return Feed::Stop;
        }
        match self.step(byte, offset) {
            Some(record) => Feed::Emit(record),
            None => Feed::Continue,
        }
    }

    fn step(&mut self, byte: u8, offset: u64) -> Option<RawRecord> {
        if self.buffering() {
            self.buf.push(byte);
        }

        if self.in_string {
            if self.escaped {
                self.escaped = false;
                self.push_string_byte(byte);
            } else if byte == b'\\' {
                self.escaped = true;
                self.push_string_byte(byte);
            } else if byte == b'"' {
                self.in_string = false;
                self.key_pending = !self.string_too_long && self.string_head == self.identifier;
            } else {
                self.push_string_byte(byte);
            }
            return None;
        }

        let key_pending = std::mem::take(&mut self.key_pending);
        let top_level = self.stack.is_empty();
        match byte {
            b'"' => {
                self.in_string = true;
                self.string_head.clear();
                self.string_too_long = false;
            },
            b' ' | b'\t' | b'\r' | b'\n' => self.key_pending = key_pending,
            // a member separator at the starting level: we are inside an object
            // that began before the stream
            b':' if top_level => {
                if self.level != Level::Settled {
                    self.drop_held("member of an enclosing object");
                    self.level = Level::Foreign;
                }
            },
            b':' if key_pending => {
                if let Some(top) = self.stack.last_mut() {
                    top.has_identifier = true;
                }
            },
            b'{' => {
                let confirmed = if top_level { self.held.take() } else { None };
                let spent = self.level == Level::Foreign;
                if !spent && !self.buffering() {
                    self.buf.clear();
                    self.buf.push(byte);
                    self.buf_origin = offset;
                }
                self.stack.push(OpenObject {
                    index: self.buf.len().saturating_sub(1),
                    has_identifier: false,
                    spent,
                });
                return confirmed;
            },
            b'[' | b']' if top_level => return self.held.take(),
            b'}' if top_level => {
                // closes an object that began before the stream did
                self.drop_held("closed by an enclosing object");
                if self.level == Level::Foreign {
                    self.level = Level::Unknown;
                }
            },
            b'}' => return self.close_object(),
            _ => {},
        }
        None
    }

    fn push_string_byte(&mut self, byte: u8) {
        if self.string_too_long {
            return;
        }
        if self.string_head.len() >= self.identifier.len() {
            self.string_too_long = true;
        } else {
            self.string_head.push(byte);
        }
    }

    fn drop_held(&mut self, reason: &str) {
        if let Some(record) = self.held.take() {
            debug!(start = record.start, reason, "Dropped nested object found after resync");
        }
    }

    fn close_object(&mut self) -> Option<RawRecord> {
        let object = self.stack.pop()?;
        if object.spent {
            return None;
        }

        // the outermost object holding the key is the record; anything keyed
        // inside it is just part of its text
        let claimed_above = self.stack.iter().any(|o| o.has_identifier);
        if object.has_identifier && !claimed_above {
            let record = RawRecord {
                text: self.buf[object.index..].to_vec(),
                start: self.buf_origin + object.index as u64,
            };
            for enclosing in &mut self.stack {
                enclosing.spent = true;
            }
            self.buf.clear();
            if self.stack.is_empty() && self.level == Level::Unknown {
                self.held = Some(record);
                return None;
            }
            return Some(record);
        }

        if !self.buffering() {
            self.buf.clear();
        }
        None
    }
}

/// Position of the first `"<identifier>"` key in `buf[from..]`.
///
/// Returns the index of the opening quote and the index just past the colon,
/// or `Err(resume)` with the index to search again from once more bytes are
/// buffered.
fn find_key(buf: &[u8], identifier: &[u8], from: usize) -> std::result::Result<(usize, usize), usize> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] != b'"' || (i > 0 && buf[i - 1] == b'\\') {
            i += 1;
            continue;
        }

        let name_end = i + 1 + identifier.len();
        if name_end >= buf.len() {
            return Err(i);
        }
        if &buf[i + 1..name_end] != identifier || buf[name_end] != b'"' {
            i += 1;
            continue;
        }

        let mut j = name_end + 1;
        while j < buf.len() && buf[j].is_ascii_whitespace() {
            j += 1;
        }
        match buf.get(j) {
            None => return Err(i),
            Some(b':') => return Ok((i, j + 1)),
            Some(_) => i += 1,
        }
    }
    Err(buf.len())
}

/// Nearest unmatched `{` before `before`, counting braces textually
fn enclosing_brace(buf: &[u8], before: usize) -> Option<usize> {
    let mut depth = 0usize;
    for k in (0..before).rev() {
        match buf[k] {
            b'}' => depth += 1,
            b'{' if depth == 0 => return Some(k),
            b'{' => depth -= 1,
            _ => {},
        }
    }
    None
}

/// Finds JSON objects that carry a given key.
///
/// A record is the outermost `{ ... }` object holding `"<identifier>":` as one
/// of its own keys; keyed objects nested inside it stay part of its text.
/// String literals and escapes are tracked so braces inside strings are
/// ignored. Everything between records (array brackets, commas, wrapper
/// objects without the identifier) is skipped. The key has to appear before
/// any nested object that carries it too, otherwise the nested one is taken.
///
/// A stream opened mid-file ([`resuming`](Self::resuming)) cannot know whether
/// it starts inside a string or inside a record. It first searches for the key
/// text, walks back to the brace that encloses it and scans from there. A
/// record found at that starting level is only emitted once the next
/// structural byte shows it is not a member of an older object: `{`, `[`, `]`
/// or end of stream confirm it, `:` or an unmatched `}` drop it.
pub struct JsonBoundaryDetector<R> {
    reader: R,
    consumed: u64,
    scanner: JsonScanner,
    /// Bytes read while looking for the first key of a resumed stream
    sync: Option<Vec<u8>>,
    sync_search_from: usize,
    replay: Vec<u8>,
    replay_pos: usize,
    replay_origin: u64,
}

impl<R: BufRead> JsonBoundaryDetector<R> {
    /// Detector for a stream that starts at the beginning of a document
    pub fn new(reader: R, identifier: &str) -> Self {
        Self {
            reader,
            consumed: 0,
            scanner: JsonScanner::new(identifier, Level::Settled),
            sync: None,
            sync_search_from: 0,
            replay: Vec::new(),
            replay_pos: 0,
            replay_origin: 0,
        }
    }

    /// Detector for a stream that starts at an arbitrary offset
    pub fn resuming(reader: R, identifier: &str) -> Self {
        Self {
            scanner: JsonScanner::new(identifier, Level::Unknown),
            sync: Some(Vec::new()),
            ..Self::new(reader, identifier)
        }
    }

    /// Read until the first key is located and queue the bytes from its
    /// enclosing brace for scanning. Returns `false` at end of stream.
    fn resync(&mut self) -> Result<bool> {
        let Some(mut sync) = self.sync.take() else {
            return Ok(true);
        };

        loop {
            match find_key(&sync, &self.scanner.identifier, self.sync_search_from) {
                Ok((quote, after)) => {
                    let from = match enclosing_brace(&sync, quote) {
                        Some(brace) => brace,
                        // key of an object that began before the stream
                        None => {
                            self.scanner.level = Level::Foreign;
                            after
                        },
                    };
                    debug!(skipped_bytes = from, "Resynchronized structured stream");
                    self.replay = sync.split_off(from);
                    self.replay_pos = 0;
                    self.replay_origin = from as u64;
                    return Ok(true);
                },
                Err(resume) => self.sync_search_from = resume,
            }

            let available = self.reader.fill_buf()?;
            if available.is_empty() {
                debug!(bytes = sync.len(), "Structured stream ended before any record key");
                return Ok(false);
            }
            let len = available.len();
            sync.extend_from_slice(available);
            self.reader.consume(len);
            self.consumed += len as u64;
        }
    }
}

fn accept(record: RawRecord, limit: u64) -> Option<RawRecord> {
    (record.start < limit).then_some(record)
}

impl<R: BufRead> BoundaryDetector for JsonBoundaryDetector<R> {
    fn next_raw(&mut self, limit: u64) -> Result<Option<RawRecord>> {
        if self.sync.is_some() && !self.resync()? {
            return Ok(None);
        }

        while self.replay_pos < self.replay.len() {
            let offset = self.replay_origin + self.replay_pos as u64;
            match self.scanner.feed(self.replay[self.replay_pos], offset, limit) {
                Feed::Stop => return Ok(None),
                Feed::Continue => self.replay_pos += 1,
                Feed::Emit(record) => {
                    self.replay_pos += 1;
                    return Ok(accept(record, limit));
                },
            }
        }
        if !self.replay.is_empty() {
            self.replay = Vec::new();
            self.replay_pos = 0;
        }

        loop {
            let available = self.reader.fill_buf()?;
            if available.is_empty() {
                if let Some(record) = self.scanner.held.take() {
                    return Ok(accept(record, limit));
                }
                if self.scanner.buffering() {
                    debug!(
                        pending_bytes = self.scanner.buf.len(),
                        "Stream ended inside an unterminated object"
                    );
                }
                return Ok(None);
            }

            let mut used = 0usize;
            let mut outcome = Feed::Continue;
            for &byte in available {
                let offset = self.consumed + used as u64;
                match self.scanner.feed(byte, offset, limit) {
                    Feed::Continue => used += 1,
                    Feed::Stop => {
                        outcome = Feed::Stop;
                        break;
                    },
                    Feed::Emit(record) => {
                        used += 1;
                        outcome = Feed::Emit(record);
                        break;
                    },
                }
            }

            self.reader.consume(used);
            self.consumed += used as u64;

            match outcome {
                Feed::Continue => {},
                Feed::Stop => return Ok(None),
                Feed::Emit(record) => return Ok(accept(record, limit)),
            }
        }
    }

    fn bytes_consumed(&self) -> u64 {
        self.consumed
    }
}
