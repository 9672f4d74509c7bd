//! Content-Length message framing for JSON-RPC byte streams.
//!
//! This module implements the HTTP-style header framing used by the Language
//! Server Protocol. The decoder is incremental: it remembers how far it has
//! scanned for the header terminator, so feeding a frame one byte at a time
//! never rescans bytes it has already looked at.
//!
//! # Wire Format
//!
//! ```text
//! (<header-line>\r\n)*
//! Content-Length: <length>\r\n
//! (<header-line>\r\n)*
//! \r\n
//! <message-body>
//! ```
//!
//! The `Content-Length` line is matched literally. Other header lines (such as
//! `Content-Type`) are accepted and ignored. The body must be a JSON object,
//! i.e. it must start with `{`.

use thiserror::Error;

/// MIME type announced in the `Content-Type` header of outgoing frames.
pub const CONTENT_TYPE: &str = "application/vscode-jsonrpc";

/// Charset announced in the `Content-Type` header of outgoing frames.
pub const CHARSET: &str = "utf-8";

/// Default cap on a single frame (100MB) to prevent OOM from malicious/buggy peers.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

const CONTENT_LENGTH_PREFIX: &[u8] = b"Content-Length: ";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const LINE_SEPARATOR: &[u8] = b"\r\n";

/// How outgoing messages are put on the wire.
///
/// The mode is a static property of a connection, never negotiated per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramingMode {
    /// `Content-Length` and `Content-Type` headers followed by the body.
    #[default]
    Headers,
    /// The JSON text alone, for transports that already delimit messages
    /// (e.g. a text-based websocket adapter).
    BodyOnly,
}

/// Fatal framing failures.
///
/// Once one of these is returned the byte stream cannot be resynchronised,
/// so the connection should be torn down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The header block ended without a `Content-Length: <digits>` line.
    #[error("Missing Content-Length header")]
    MissingContentLength,

    /// A header line contained a bare CR or LF, or was empty.
    #[error("Malformed header line: {0:?}")]
    MalformedHeader(String),

    /// The declared body length, or an unterminated header, exceeds the cap.
    #[error("Frame size {size} exceeds maximum {max} bytes")]
    TooLarge {
        /// Declared or buffered size in bytes
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// The body does not start with `{`.
    #[error("Message body must be a JSON object, found leading byte {0:#04x}")]
    UnsupportedBody(u8),
}

/// Parser position within the current frame. Offsets index the whole buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Looking for the blank line; bytes before `scanned` have been searched already.
    Header { scanned: usize },
    /// Header parsed; waiting for `length` body bytes after `body_start`.
    Body { body_start: usize, length: usize },
}

/// Incremental decoder turning arbitrary byte chunks into message bodies.
///
/// # Example
///
/// ```ignore
/// let mut decoder = FrameDecoder::new();
/// for body in decoder.decode(chunk)? {
///     let message: serde_json::Value = serde_json::from_slice(&body)?;
/// }
/// ```
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Bytes at the front of `buffer` that belong to frames already returned
    consumed: usize,
    state: DecodeState,
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a decoder with the default frame size cap.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a decoder that rejects frames larger than `max_frame_size` bytes.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            consumed: 0,
            state: DecodeState::Header { scanned: 0 },
            max_frame_size,
        }
    }

    /// Number of bytes held for a frame that is not complete yet.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() - self.consumed
    }

    /// Append a chunk received from the transport.
    ///
    /// Frames returned since the last push are discarded first, in one move.
    pub fn push(&mut self, chunk: &[u8]) {
        self.compact();
        self.buffer.extend_from_slice(chunk);
    }

    fn compact(&mut self) {
        if self.consumed == 0 {
            return;
        }
        let consumed = std::mem::take(&mut self.consumed);
        self.buffer.drain(..consumed);
        self.state = match self.state {
            DecodeState::Header { scanned } => DecodeState::Header {
                scanned: scanned - consumed,
            },
            DecodeState::Body { body_start, length } => DecodeState::Body {
                body_start: body_start - consumed,
                length,
            },
        };
    }

    /// Append a chunk and extract every frame that is now complete.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] if the buffered data can never form a valid frame.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        self.push(chunk);

        let mut bodies = Vec::new();
        while let Some(body) = self.next_frame()? {
            bodies.push(body);
        }
        Ok(bodies)
    }

    /// Extract the next complete body, if the buffer holds one.
    ///
    /// Returns `Ok(None)` when more data is needed.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] if the buffered data can never form a valid frame.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            match self.state {
                DecodeState::Header { scanned } => {
                    // Back up so a terminator split across chunks is still found
                    let start = scanned
                        .saturating_sub(HEADER_TERMINATOR.len() - 1)
                        .max(self.consumed);
                    let Some(offset) = find(&self.buffer[start..], HEADER_TERMINATOR) else {
                        if self.buffered_len() > self.max_frame_size {
                            return Err(FrameError::TooLarge {
                                size: self.buffered_len(),
                                max: self.max_frame_size,
                            });
                        }
                        self.state = DecodeState::Header {
                            scanned: self.buffer.len(),
                        };
                        return Ok(None);
                    };

                    let header_end = start + offset;
                    let length = parse_content_length(&self.buffer[self.consumed..header_end])?;
                    if length > self.max_frame_size {
                        return Err(FrameError::TooLarge {
                            size: length,
                            max: self.max_frame_size,
                        });
                    }

                    self.state = DecodeState::Body {
                        body_start: header_end + HEADER_TERMINATOR.len(),
                        length,
                    };
                }
                DecodeState::Body { body_start, length } => {
                    let available = self.buffer.len() - body_start;

                    if length > 0 && available > 0 && self.buffer[body_start] != b'{' {
                        return Err(FrameError::UnsupportedBody(self.buffer[body_start]));
                    }

                    if available < length {
                        return Ok(None);
                    }

                    let body_end = body_start + length;
                    let body = self.buffer[body_start..body_end].to_vec();
                    self.consumed = body_end;
                    self.state = DecodeState::Header { scanned: body_end };
                    return Ok(Some(body));
                }
            }
        }
    }
}

/// Parse the header block (without its terminating blank line).
fn parse_content_length(block: &[u8]) -> Result<usize, FrameError> {
    let mut content_length = None;

    for line in split(block, LINE_SEPARATOR) {
        if line.is_empty() || line.iter().any(|b| *b == b'\r' || *b == b'\n') {
            return Err(FrameError::MalformedHeader(
                String::from_utf8_lossy(line).into_owned(),
            ));
        }

        // Lines that merely look like Content-Length are ordinary headers
        if let Some(digits) = line.strip_prefix(CONTENT_LENGTH_PREFIX) {
            if !digits.is_empty() && digits.iter().all(u8::is_ascii_digit) {
                // All digits, so parsing can only fail on overflow
                let value = std::str::from_utf8(digits).unwrap_or_default();
                content_length = Some(value.parse::<usize>().unwrap_or(usize::MAX));
            }
        }
    }

    content_length.ok_or(FrameError::MissingContentLength)
}

/// Encode a serialized JSON body for the wire.
///
/// An empty body produces an empty frame, which callers treat as nothing to send.
pub fn encode_frame(body: &str, mode: FramingMode) -> Vec<u8> {
    if body.is_empty() {
        return Vec::new();
    }

    match mode {
        FramingMode::BodyOnly => body.as_bytes().to_vec(),
        FramingMode::Headers => {
            let header = format!(
                "Content-Length: {}\r\nContent-Type: {}; charset={}\r\n\r\n",
                body.len(),
                CONTENT_TYPE,
                CHARSET
            );
            let mut frame = Vec::with_capacity(header.len() + body.len());
            frame.extend_from_slice(header.as_bytes());
            frame.extend_from_slice(body.as_bytes());
            frame
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn split<'a>(data: &'a [u8], separator: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
    let mut rest = Some(data);
    std::iter::from_fn(move || {
        let current = rest?;
        match find(current, separator) {
            Some(pos) => {
                rest = Some(&current[pos + separator.len()..]);
                Some(&current[..pos])
            }
            None => {
                rest = None;
                Some(current)
            }
        }
    })
}
