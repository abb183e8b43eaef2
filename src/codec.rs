//! Event stream encoding and decoding.
//!
//! Segments store events in JSON Lines format: one JSON object per line.
//! Application event types are ordinary serde types; an internally tagged
//! enum gives each event a self-describing `"type"` field on the wire.
//!
//! # Stream format
//!
//! Every encoded stream opens with a header line identifying the format and
//! its version:
//!
//! ```json
//! {"stream":"plog","version":1}
//! ```
//!
//! The header is written lazily, immediately before the first event, so a
//! bound-but-unused encoder leaves its segment empty. Because a rotation
//! hand-off can replay two segments as one concatenated byte stream, the
//! decoder accepts header lines anywhere in the input: each one is validated
//! and skipped.
//!
//! # Crash tolerance
//!
//! Appends carry no fsync promise, so a crash can leave a final line without
//! its terminating newline. The decoder treats such a tail as end-of-stream
//! (logged at warn). A *newline-terminated* line that fails to parse is
//! corruption and surfaces as an error.

use std::io::{self, BufRead, BufReader, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current stream format version. Increment when making breaking changes.
pub const STREAM_VERSION: u32 = 1;

/// Stream name carried in every header line.
const STREAM_NAME: &str = "plog";

/// Errors that can occur while encoding or decoding an event stream.
#[derive(Debug, Error)]
pub enum CodecError {
    /// IO error reading or writing the stream.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error on a complete line.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A non-empty stream did not begin with a header line.
    #[error("stream does not begin with a header line")]
    MissingHeader,

    /// The stream header carries a version this build cannot read.
    #[error("unsupported stream version: expected {expected}, got {got}")]
    UnsupportedVersion { expected: u32, got: u32 },
}

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// The header line that opens every encoded stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamHeader {
    /// Stream format name, always `"plog"`.
    pub stream: String,

    /// Stream format version.
    pub version: u32,
}

impl StreamHeader {
    /// Returns the header for the current format version.
    pub fn current() -> Self {
        StreamHeader {
            stream: STREAM_NAME.to_string(),
            version: STREAM_VERSION,
        }
    }

    /// Returns true if this header names the plog stream format.
    fn is_plog(&self) -> bool {
        self.stream == STREAM_NAME
    }
}

/// Writes events to a byte sink as JSON Lines.
///
/// The encoder holds no reference to its sink; the sink is passed to each
/// [`Encoder::encode`] call. This lets the log coordinator own both the
/// encoder and the destination it feeds without a self-referential borrow.
///
/// A fresh encoder must be bound whenever a new segment starts, so the
/// header latch resets and the segment opens with its own header line.
#[derive(Debug, Default)]
pub struct Encoder {
    wrote_header: bool,
}

impl Encoder {
    /// Creates an encoder for a fresh stream. No bytes are written until the
    /// first [`Encoder::encode`] call.
    pub fn new() -> Self {
        Encoder {
            wrote_header: false,
        }
    }

    /// Encodes one event as a single line, preceded by the stream header if
    /// this is the first write of the stream.
    ///
    /// The event is serialized to a string before any byte reaches the sink,
    /// so a failed serialization never tears the segment.
    pub fn encode<W: Write, E: Serialize>(&mut self, sink: &mut W, event: &E) -> Result<()> {
        let line = serde_json::to_string(event)?;
        if !self.wrote_header {
            let header = serde_json::to_string(&StreamHeader::current())?;
            sink.write_all(header.as_bytes())?;
            sink.write_all(b"\n")?;
            self.wrote_header = true;
        }
        sink.write_all(line.as_bytes())?;
        sink.write_all(b"\n")?;
        Ok(())
    }
}

/// Reads events back from a byte source produced by [`Encoder`].
///
/// One decoder serves one replay source. A source may be the concatenation
/// of two segments (see `ConcatReader`), in which case the second segment's
/// header appears mid-stream and is skipped after validation.
pub struct Decoder<R: Read> {
    reader: BufReader<R>,
    seen_header: bool,
    line: Vec<u8>,
}

impl<R: Read> Decoder<R> {
    /// Creates a decoder over a replay source.
    pub fn new(source: R) -> Self {
        Decoder {
            reader: BufReader::new(source),
            seen_header: false,
            line: Vec::new(),
        }
    }

    /// Decodes the next event, or returns `None` at end of stream.
    ///
    /// Header lines are validated and skipped wherever they appear. A final
    /// line without its terminating newline is discarded as a torn tail.
    pub fn next<E: DeserializeOwned>(&mut self) -> Result<Option<E>> {
        loop {
            self.line.clear();
            let n = self.reader.read_until(b'\n', &mut self.line)?;
            if n == 0 {
                return Ok(None);
            }

            if self.line.last() != Some(&b'\n') {
                // Crash mid-append: the record never committed.
                tracing::warn!(bytes = n, "discarding unterminated trailing line");
                return Ok(None);
            }

            let trimmed = trim_line(&self.line);
            if trimmed.is_empty() {
                continue;
            }

            if let Ok(header) = serde_json::from_slice::<StreamHeader>(trimmed)
                && header.is_plog()
            {
                if header.version != STREAM_VERSION {
                    return Err(CodecError::UnsupportedVersion {
                        expected: STREAM_VERSION,
                        got: header.version,
                    });
                }
                self.seen_header = true;
                continue;
            }

            if !self.seen_header {
                return Err(CodecError::MissingHeader);
            }

            return Ok(Some(serde_json::from_slice(trimmed)?));
        }
    }
}

/// Strips the trailing newline (and any surrounding ASCII whitespace) from a
/// raw line.
fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end]
}
