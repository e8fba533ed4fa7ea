//! Codec unit tests.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::BytesMut;

use crate::codec::{
    encode_request_head, ParseOutcome, RequestHead, ResponseDecoder, ResponseDecoderSharedPtr,
    ResponseHead, ResponseParser,
};

#[derive(Default)]
struct RecordingDecoder {
    status: Option<u16>,
    headers_end_stream: bool,
    body: Vec<u8>,
    data_end_stream: bool,
    complete: bool,
}

impl ResponseDecoder for RecordingDecoder {
    fn decode_headers(&mut self, head: &ResponseHead, end_stream: bool) {
        self.status = Some(head.status);
        self.headers_end_stream = end_stream;
        self.complete = self.complete || end_stream;
    }

    fn decode_data(&mut self, data: &[u8], end_stream: bool) {
        self.body.extend_from_slice(data);
        self.data_end_stream = end_stream;
        self.complete = self.complete || end_stream;
    }
}

fn decoder() -> (ResponseDecoderSharedPtr, Rc<RefCell<RecordingDecoder>>) {
    let inner = Rc::new(RefCell::new(RecordingDecoder::default()));
    (inner.clone() as ResponseDecoderSharedPtr, inner)
}

fn parse_all(parser: &mut ResponseParser, bytes: &[u8], d: &ResponseDecoderSharedPtr) -> bool {
    let mut data = BytesMut::from(bytes);
    match parser.parse(&mut data, Some(d)).unwrap() {
        ParseOutcome::Complete { connection_close } => connection_close,
        ParseOutcome::NeedMore => panic!("expected a complete response"),
    }
}

#[test]
fn test_encode_request_head_minimal() {
    let head = RequestHead::new("GET", "/healthz", "backend.internal");
    let bytes = encode_request_head(&head, true);
    let text = String::from_utf8(bytes).unwrap();
    assert!(text.starts_with("GET /healthz HTTP/1.1\r\n"));
    assert!(text.contains("host: backend.internal\r\n"));
    assert!(text.contains("content-length: 0\r\n"));
    assert!(text.ends_with("\r\n\r\n"));
}

#[test]
fn test_encode_request_head_keeps_explicit_length() {
    let mut head = RequestHead::new("POST", "/upload", "h");
    head.headers.push(("content-length".to_string(), "5".to_string()));
    let text = String::from_utf8(encode_request_head(&head, false)).unwrap();
    assert_eq!(1, text.matches("content-length").count());
}

#[test]
fn test_parse_content_length_body() {
    let (d, rec) = decoder();
    let mut parser = ResponseParser::default();
    let close = parse_all(
        &mut parser,
        b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello",
        &d,
    );
    assert!(!close);
    let rec = rec.borrow();
    assert_eq!(Some(200), rec.status);
    assert_eq!(b"hello".as_slice(), rec.body.as_slice());
    assert!(rec.data_end_stream);
}

#[test]
fn test_parse_zero_length_completes_at_headers() {
    let (d, rec) = decoder();
    let mut parser = ResponseParser::default();
    let close = parse_all(
        &mut parser,
        b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n",
        &d,
    );
    assert!(!close);
    assert!(rec.borrow().headers_end_stream);
    assert!(rec.borrow().body.is_empty());
}

#[test]
fn test_parse_connection_close_header() {
    let (d, _) = decoder();
    let mut parser = ResponseParser::default();
    // Token match is case-insensitive, as sent by some upstreams.
    let close = parse_all(
        &mut parser,
        b"HTTP/1.1 200 OK\r\nConnection: Close\r\ncontent-length: 0\r\n\r\n",
        &d,
    );
    assert!(close);
}

#[test]
fn test_parse_http10_defaults_to_close() {
    let (d, _) = decoder();
    let mut parser = ResponseParser::default();
    let close = parse_all(
        &mut parser,
        b"HTTP/1.0 200 OK\r\ncontent-length: 0\r\n\r\n",
        &d,
    );
    assert!(close);
}

#[test]
fn test_parse_chunked_body_with_trailers() {
    let (d, rec) = decoder();
    let mut parser = ResponseParser::default();
    let close = parse_all(
        &mut parser,
        b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n\
          5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nx-trailer: 1\r\n\r\n",
        &d,
    );
    assert!(!close);
    assert_eq!(b"hello world".as_slice(), rec.borrow().body.as_slice());
    assert!(rec.borrow().data_end_stream);
}

#[test]
fn test_parse_incremental_delivery() {
    let (d, rec) = decoder();
    let mut parser = ResponseParser::default();

    let full = b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\n0123456789";
    for chunk in full.chunks(7) {
        let mut data = BytesMut::from(chunk);
        let _ = parser.parse(&mut data, Some(&d)).unwrap();
    }
    assert_eq!(b"0123456789".as_slice(), rec.borrow().body.as_slice());
    assert!(rec.borrow().complete);
}

#[test]
fn test_parser_resets_between_responses() {
    let (d, rec) = decoder();
    let mut parser = ResponseParser::default();

    parse_all(&mut parser, b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nab", &d);
    parse_all(&mut parser, b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\ncd", &d);
    assert_eq!(b"abcd".as_slice(), rec.borrow().body.as_slice());
}

#[test]
fn test_parse_until_close_body() {
    let (d, rec) = decoder();
    let mut parser = ResponseParser::default();

    let mut data = BytesMut::from(&b"HTTP/1.1 200 OK\r\n\r\npartial"[..]);
    match parser.parse(&mut data, Some(&d)).unwrap() {
        ParseOutcome::NeedMore => {}
        ParseOutcome::Complete { .. } => panic!("close-delimited body cannot self-complete"),
    }
    assert_eq!(b"partial".as_slice(), rec.borrow().body.as_slice());
    assert!(!rec.borrow().complete);

    // The connection closing is what completes the response.
    assert!(parser.complete_on_close(Some(&d)));
    assert!(rec.borrow().complete);
}

#[test]
fn test_parse_rejects_garbage() {
    let (d, _) = decoder();
    let mut parser = ResponseParser::default();
    let mut data = BytesMut::from(&b"NOT HTTP AT ALL\r\n\r\n"[..]);
    assert!(parser.parse(&mut data, Some(&d)).is_err());
}

#[test]
fn test_stray_data_without_stream_is_an_error() {
    let mut parser = ResponseParser::default();
    let mut data = BytesMut::from(&b"HTTP/1.1 200 OK\r\n"[..]);
    assert!(parser.parse(&mut data, None).is_err());
}
