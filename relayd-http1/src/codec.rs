//! HTTP/1 wire codec for upstream requests.
//!
//! Request heads serialise straight to bytes; responses stream through an
//! incremental parser that handles content-length, chunked, and
//! close-delimited bodies. The parser resets itself after each complete
//! response so one instance serves a keep-alive connection for its lifetime.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::BytesMut;
use thiserror::Error;

/// Maximum response header block we will buffer before giving up.
const MAX_RESPONSE_HEADERS_SIZE: usize = 65536;
const MAX_RESPONSE_HEADERS: usize = 64;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("response headers exceed {MAX_RESPONSE_HEADERS_SIZE} bytes")]
    HeadersTooLarge,

    #[error("unexpected data outside a response")]
    StrayData,
}

/// Request line plus headers. `host` becomes the Host header.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub host: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn new(method: &str, path: &str, host: &str) -> RequestHead {
        RequestHead {
            method: method.to_string(),
            path: path.to_string(),
            host: host.to_string(),
            headers: Vec::new(),
        }
    }
}

/// Parsed response status line and headers.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Case-insensitive single-header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the peer asked for the connection to close after this
    /// response (token match, case-insensitive).
    pub fn connection_close(&self) -> bool {
        self.header("connection").is_some_and(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("close"))
        })
    }
}

/// Receives decoded response events for one stream.
pub trait ResponseDecoder {
    fn decode_headers(&mut self, head: &ResponseHead, end_stream: bool);
    fn decode_data(&mut self, data: &[u8], end_stream: bool);
}

pub type ResponseDecoderSharedPtr = Rc<RefCell<dyn ResponseDecoder>>;

/// Serialise a request head. With `end_stream` set and no explicit length a
/// zero content-length is added so the upstream knows the message is done.
pub fn encode_request_head(head: &RequestHead, end_stream: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(head.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(head.path.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\nhost: ");
    out.extend_from_slice(head.host.as_bytes());
    out.extend_from_slice(b"\r\n");

    let mut has_length = false;
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            has_length = true;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    if end_stream && !has_length {
        out.extend_from_slice(b"content-length: 0\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Chunked transfer decoding state machine (RFC 7230 section 4.1), including
/// chunk extensions and trailers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    ChunkSize,
    ChunkExtension,
    ChunkSizeLf,
    ChunkData,
    ChunkDataCr,
    ChunkDataLf,
    TrailerLine,
    TrailerLf,
    Complete,
}

struct ChunkedDecoder {
    state: ChunkedState,
    chunk_remaining: u64,
    size_accumulator: u64,
    size_has_digit: bool,
    trailer_line_empty: bool,
}

enum ChunkedByte {
    Framing,
    Data(u8),
    Complete,
}

impl ChunkedDecoder {
    fn new() -> ChunkedDecoder {
        ChunkedDecoder {
            state: ChunkedState::ChunkSize,
            chunk_remaining: 0,
            size_accumulator: 0,
            size_has_digit: false,
            trailer_line_empty: true,
        }
    }

    fn feed_byte(&mut self, byte: u8) -> Result<ChunkedByte, CodecError> {
        match self.state {
            ChunkedState::ChunkSize => {
                match byte {
                    b'0'..=b'9' => {
                        self.size_accumulator =
                            self.size_accumulator.saturating_mul(16) + u64::from(byte - b'0');
                        self.size_has_digit = true;
                    }
                    b'a'..=b'f' => {
                        self.size_accumulator = self.size_accumulator.saturating_mul(16)
                            + u64::from(byte - b'a' + 10);
                        self.size_has_digit = true;
                    }
                    b'A'..=b'F' => {
                        self.size_accumulator = self.size_accumulator.saturating_mul(16)
                            + u64::from(byte - b'A' + 10);
                        self.size_has_digit = true;
                    }
                    b';' => self.state = ChunkedState::ChunkExtension,
                    b'\r' => self.state = ChunkedState::ChunkSizeLf,
                    _ => {
                        return Err(CodecError::InvalidResponse(
                            "bad chunk size character".to_string(),
                        ))
                    }
                }
                Ok(ChunkedByte::Framing)
            }

            ChunkedState::ChunkExtension => {
                if byte == b'\r' {
                    self.state = ChunkedState::ChunkSizeLf;
                }
                Ok(ChunkedByte::Framing)
            }

            ChunkedState::ChunkSizeLf => {
                if byte != b'\n' || !self.size_has_digit {
                    return Err(CodecError::InvalidResponse(
                        "malformed chunk size line".to_string(),
                    ));
                }
                if self.size_accumulator == 0 {
                    self.state = ChunkedState::TrailerLine;
                    self.trailer_line_empty = true;
                } else {
                    self.chunk_remaining = self.size_accumulator;
                    self.state = ChunkedState::ChunkData;
                }
                self.size_accumulator = 0;
                self.size_has_digit = false;
                Ok(ChunkedByte::Framing)
            }

            ChunkedState::ChunkData => {
                self.chunk_remaining -= 1;
                if self.chunk_remaining == 0 {
                    self.state = ChunkedState::ChunkDataCr;
                }
                Ok(ChunkedByte::Data(byte))
            }

            ChunkedState::ChunkDataCr => {
                if byte != b'\r' {
                    return Err(CodecError::InvalidResponse(
                        "missing CR after chunk data".to_string(),
                    ));
                }
                self.state = ChunkedState::ChunkDataLf;
                Ok(ChunkedByte::Framing)
            }

            ChunkedState::ChunkDataLf => {
                if byte != b'\n' {
                    return Err(CodecError::InvalidResponse(
                        "missing LF after chunk data".to_string(),
                    ));
                }
                self.state = ChunkedState::ChunkSize;
                Ok(ChunkedByte::Framing)
            }

            ChunkedState::TrailerLine => {
                if byte == b'\r' {
                    self.state = ChunkedState::TrailerLf;
                } else {
                    self.trailer_line_empty = false;
                }
                Ok(ChunkedByte::Framing)
            }

            ChunkedState::TrailerLf => {
                if byte != b'\n' {
                    return Err(CodecError::InvalidResponse(
                        "malformed trailer line".to_string(),
                    ));
                }
                if self.trailer_line_empty {
                    self.state = ChunkedState::Complete;
                    Ok(ChunkedByte::Complete)
                } else {
                    self.state = ChunkedState::TrailerLine;
                    self.trailer_line_empty = true;
                    Ok(ChunkedByte::Framing)
                }
            }

            ChunkedState::Complete => Ok(ChunkedByte::Complete),
        }
    }
}

enum BodyKind {
    None,
    Length(u64),
    Chunked(ChunkedDecoder),
    /// No framing; the body runs until the peer closes.
    UntilClose,
}

enum ParserState {
    Headers,
    Body {
        kind: BodyKind,
        connection_close: bool,
    },
}

/// Outcome of feeding bytes to the parser.
pub(crate) enum ParseOutcome {
    NeedMore,
    Complete { connection_close: bool },
}

/// Incremental response parser for one upstream connection.
pub(crate) struct ResponseParser {
    state: ParserState,
    header_buf: BytesMut,
}

impl Default for ResponseParser {
    fn default() -> ResponseParser {
        ResponseParser {
            state: ParserState::Headers,
            header_buf: BytesMut::new(),
        }
    }
}

impl ResponseParser {
    /// Consume `data`, driving the decoder. Returns `Complete` once per
    /// response; the parser is then reset for the next one.
    pub(crate) fn parse(
        &mut self,
        data: &mut BytesMut,
        decoder: Option<&ResponseDecoderSharedPtr>,
    ) -> Result<ParseOutcome, CodecError> {
        if matches!(self.state, ParserState::Headers) && !data.is_empty() && decoder.is_none() {
            return Err(CodecError::StrayData);
        }

        loop {
            match &mut self.state {
                ParserState::Headers => {
                    self.header_buf.extend_from_slice(data);
                    data.clear();
                    if self.header_buf.len() > MAX_RESPONSE_HEADERS_SIZE {
                        return Err(CodecError::HeadersTooLarge);
                    }

                    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
                    let mut response = httparse::Response::new(&mut headers);
                    let header_len = match response.parse(&self.header_buf) {
                        Ok(httparse::Status::Complete(len)) => len,
                        Ok(httparse::Status::Partial) => return Ok(ParseOutcome::NeedMore),
                        Err(e) => return Err(CodecError::InvalidResponse(e.to_string())),
                    };

                    let head = ResponseHead {
                        status: response.code.unwrap_or(0),
                        headers: response
                            .headers
                            .iter()
                            .map(|h| {
                                (
                                    h.name.to_string(),
                                    String::from_utf8_lossy(h.value).to_string(),
                                )
                            })
                            .collect(),
                    };

                    // HTTP/1.0 without an explicit keep-alive also closes.
                    let connection_close = head.connection_close()
                        || (response.version == Some(0)
                            && !head
                                .header("connection")
                                .is_some_and(|v| v.eq_ignore_ascii_case("keep-alive")));

                    let kind = body_kind(&head)?;
                    let end_stream = matches!(kind, BodyKind::None);
                    if let Some(decoder) = decoder {
                        decoder.borrow_mut().decode_headers(&head, end_stream);
                    }

                    // Whatever followed the header block is body.
                    let mut rest = self.header_buf.split_off(header_len);
                    std::mem::swap(data, &mut rest);
                    self.header_buf.clear();

                    if end_stream {
                        self.state = ParserState::Headers;
                        return Ok(ParseOutcome::Complete { connection_close });
                    }
                    self.state = ParserState::Body {
                        kind,
                        connection_close,
                    };
                }

                ParserState::Body {
                    kind,
                    connection_close,
                } => {
                    let connection_close = *connection_close;
                    let mut response_done = false;

                    match kind {
                        BodyKind::None => unreachable!("none bodies complete at headers"),

                        BodyKind::Length(remaining) => {
                            if data.is_empty() {
                                return Ok(ParseOutcome::NeedMore);
                            }
                            let take = (*remaining).min(data.len() as u64) as usize;
                            let chunk = data.split_to(take);
                            *remaining -= take as u64;
                            let end_stream = *remaining == 0;
                            if let Some(decoder) = decoder {
                                decoder.borrow_mut().decode_data(&chunk, end_stream);
                            }
                            response_done = end_stream;
                        }

                        BodyKind::Chunked(chunked) => {
                            if data.is_empty() {
                                return Ok(ParseOutcome::NeedMore);
                            }
                            let mut body = Vec::new();
                            let mut complete = false;
                            while !data.is_empty() {
                                let byte = data.split_to(1)[0];
                                match chunked.feed_byte(byte)? {
                                    ChunkedByte::Framing => {}
                                    ChunkedByte::Data(b) => body.push(b),
                                    ChunkedByte::Complete => {
                                        complete = true;
                                        break;
                                    }
                                }
                            }
                            if let Some(decoder) = decoder {
                                if !body.is_empty() || complete {
                                    decoder.borrow_mut().decode_data(&body, complete);
                                }
                            }
                            response_done = complete;
                        }

                        BodyKind::UntilClose => {
                            if !data.is_empty() {
                                let chunk = data.split();
                                if let Some(decoder) = decoder {
                                    decoder.borrow_mut().decode_data(&chunk, false);
                                }
                            }
                            return Ok(ParseOutcome::NeedMore);
                        }
                    }

                    if response_done {
                        self.state = ParserState::Headers;
                        return Ok(ParseOutcome::Complete { connection_close });
                    }
                }
            }
        }
    }

    /// Remote close while decoding: a close-delimited body completes, any
    /// other mid-response state does not.
    pub(crate) fn complete_on_close(
        &mut self,
        decoder: Option<&ResponseDecoderSharedPtr>,
    ) -> bool {
        if let ParserState::Body {
            kind: BodyKind::UntilClose,
            ..
        } = &self.state
        {
            if let Some(decoder) = decoder {
                decoder.borrow_mut().decode_data(&[], true);
            }
            self.state = ParserState::Headers;
            return true;
        }
        false
    }
}

fn body_kind(head: &ResponseHead) -> Result<BodyKind, CodecError> {
    if head.status == 204 || head.status == 304 || (100..200).contains(&head.status) {
        return Ok(BodyKind::None);
    }

    let chunked = head.header("transfer-encoding").is_some_and(|value| {
        value
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
    });
    if chunked {
        return Ok(BodyKind::Chunked(ChunkedDecoder::new()));
    }

    match head.header("content-length") {
        Some(value) => {
            let length: u64 = value
                .trim()
                .parse()
                .map_err(|_| CodecError::InvalidResponse("bad content-length".to_string()))?;
            if length == 0 {
                Ok(BodyKind::None)
            } else {
                Ok(BodyKind::Length(length))
            }
        }
        None => Ok(BodyKind::UntilClose),
    }
}
