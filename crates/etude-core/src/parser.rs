// src/parser.rs
//! Incremental request parser.
//!
//! A main state machine (request line, headers, body) is driven by a line
//! scanner that remembers how far it got, so the parser can be re-entered each
//! time the reactor appends bytes without re-scanning anything. Parsed fields
//! are stored as spans into the owned buffer and checked against the filled
//! region whenever they are read back.

use crate::http::Method;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("line is not terminated by CRLF")]
    BadLineEnding,
    #[error("request line must be `METHOD target version`")]
    BadRequestLine,
    #[error("only GET is supported")]
    UnsupportedMethod,
    #[error("request target is not an absolute path")]
    BadTarget,
    #[error("protocol version is not HTTP/1.1")]
    BadVersion,
    #[error("malformed Host header")]
    BadHost,
    #[error("malformed Content-Length header")]
    BadContentLength,
    #[error("request does not fit in the read buffer")]
    TooLarge,
    #[error("request target is not valid UTF-8")]
    NotUtf8,
}

/// Byte range `[start, end)` into the read buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Main state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    RequestLine,
    Headers,
    /// Headers are done; the body starts at `start`.
    Body { start: usize },
}

/// Result of one pass of the line scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    Complete(Span),
    Bad,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More bytes are needed before the request is complete.
    Incomplete,
    Complete,
}

#[derive(Debug, Clone, Copy, Default)]
struct RequestHead {
    method: Option<Method>,
    target: Option<Span>,
    path: Option<Span>,
    query: Option<Span>,
    version: Option<Span>,
    host: Option<Span>,
    port: Option<u16>,
    keep_alive: bool,
    content_length: usize,
}

pub struct RequestParser {
    buf: Box<[u8]>,
    read_len: usize,
    cursor: usize,
    line_start: usize,
    state: CheckState,
    head: RequestHead,
}

impl RequestParser {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            read_len: 0,
            cursor: 0,
            line_start: 0,
            state: CheckState::RequestLine,
            head: RequestHead::default(),
        }
    }

    /// Forgets everything parsed or buffered so far.
    pub fn reset(&mut self) {
        self.read_len = 0;
        self.cursor = 0;
        self.line_start = 0;
        self.state = CheckState::RequestLine;
        self.head = RequestHead::default();
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn read_len(&self) -> usize {
        self.read_len
    }

    /// Bytes consumed by the line scanner.
    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[inline]
    pub fn line_start(&self) -> usize {
        self.line_start
    }

    #[inline]
    pub fn state(&self) -> CheckState {
        self.state
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.read_len == self.buf.len()
    }

    /// Unfilled tail of the buffer, for the socket to read into.
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.read_len..]
    }

    /// Marks `n` bytes of [`spare_mut`](Self::spare_mut) as filled.
    #[inline]
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.read_len + n <= self.buf.len());
        self.read_len = (self.read_len + n).min(self.buf.len());
    }

    /// Copies as much of `bytes` as fits; returns how many were taken.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> usize {
        let spare = self.spare_mut();
        let n = spare.len().min(bytes.len());
        spare[..n].copy_from_slice(&bytes[..n]);
        self.advance(n);
        n
    }

    /// Runs the state machine over everything buffered so far.
    pub fn parse(&mut self) -> Result<Progress, ParseError> {
        loop {
            if let CheckState::Body { start } = self.state {
                let need = self.head.content_length;
                if need > self.buf.len() - start {
                    return Err(ParseError::TooLarge);
                }
                return Ok(if self.read_len - start >= need {
                    Progress::Complete
                } else {
                    Progress::Incomplete
                });
            }

            let line = match self.parse_line() {
                LineStatus::Complete(line) => line,
                LineStatus::Open if self.is_full() => return Err(ParseError::TooLarge),
                LineStatus::Open => return Ok(Progress::Incomplete),
                LineStatus::Bad => return Err(ParseError::BadLineEnding),
            };
            self.line_start = self.cursor;

            match self.state {
                CheckState::RequestLine => {
                    self.parse_request_line(line)?;
                    self.state = CheckState::Headers;
                }
                CheckState::Headers if line.is_empty() => {
                    self.state = CheckState::Body { start: self.cursor };
                }
                CheckState::Headers => self.parse_header(line)?,
                CheckState::Body { .. } => unreachable!("body stage returns above"),
            }
        }
    }

    /// Scans forward from the cursor for the next CRLF-terminated line.
    pub fn parse_line(&mut self) -> LineStatus {
        while self.cursor < self.read_len {
            match self.buf[self.cursor] {
                b'\r' => {
                    if self.cursor + 1 == self.read_len {
                        // Leave the cursor on the CR so the LF is checked next time.
                        return LineStatus::Open;
                    }
                    if self.buf[self.cursor + 1] != b'\n' {
                        return LineStatus::Bad;
                    }
                    let line = Span {
                        start: self.line_start,
                        end: self.cursor,
                    };
                    self.cursor += 2;
                    return LineStatus::Complete(line);
                }
                b'\n' => return LineStatus::Bad,
                _ => self.cursor += 1,
            }
        }
        LineStatus::Open
    }

    fn parse_request_line(&mut self, line: Span) -> Result<(), ParseError> {
        let mut parts = [Span::default(); 3];
        let mut count = 0;
        let mut i = line.start;
        while i < line.end {
            while i < line.end && is_blank(self.buf[i]) {
                i += 1;
            }
            if i == line.end {
                break;
            }
            let start = i;
            while i < line.end && !is_blank(self.buf[i]) {
                i += 1;
            }
            if count == parts.len() {
                return Err(ParseError::BadRequestLine);
            }
            parts[count] = Span { start, end: i };
            count += 1;
        }
        if count != parts.len() {
            return Err(ParseError::BadRequestLine);
        }
        let [method, target, version] = parts;

        if Method::from_bytes(self.bytes(method)) != Method::Get {
            return Err(ParseError::UnsupportedMethod);
        }
        if !self.bytes(version).eq_ignore_ascii_case(b"HTTP/1.1") {
            return Err(ParseError::BadVersion);
        }

        let path_start = self.path_start(target)?;
        let (path, query) = match self.buf[path_start..target.end].iter().position(|&b| b == b'?') {
            Some(q) => (
                Span {
                    start: path_start,
                    end: path_start + q,
                },
                Some(Span {
                    start: path_start + q + 1,
                    end: target.end,
                }),
            ),
            None => (
                Span {
                    start: path_start,
                    end: target.end,
                },
                None,
            ),
        };
        if std::str::from_utf8(self.bytes(target)).is_err() {
            return Err(ParseError::NotUtf8);
        }

        self.head.method = Some(Method::Get);
        self.head.target = Some(target);
        self.head.path = Some(path);
        self.head.query = query;
        self.head.version = Some(version);
        Ok(())
    }

    // Absolute-form targets (`scheme://authority/path`) are cut down to their path.
    fn path_start(&self, target: Span) -> Result<usize, ParseError> {
        let bytes = self.bytes(target);
        if bytes.first() == Some(&b'/') {
            return Ok(target.start);
        }
        let scheme_end = bytes
            .windows(3)
            .position(|w| w == b"://")
            .filter(|&pos| pos > 0 && bytes[..pos].iter().all(|b| b.is_ascii_alphabetic()))
            .ok_or(ParseError::BadTarget)?;
        let authority = target.start + scheme_end + 3;
        self.buf[authority..target.end]
            .iter()
            .position(|&b| b == b'/')
            .map(|p| authority + p)
            .ok_or(ParseError::BadTarget)
    }

    fn parse_header(&mut self, line: Span) -> Result<(), ParseError> {
        let Some(colon) = self.bytes(line).iter().position(|&b| b == b':') else {
            // Not a header we can use.
            return Ok(());
        };
        let name = Span {
            start: line.start,
            end: line.start + colon,
        };
        let value = self.trim(Span {
            start: name.end + 1,
            end: line.end,
        });
        let name = self.bytes(name);

        if name.eq_ignore_ascii_case(b"host") {
            self.parse_host(value)?;
        } else if name.eq_ignore_ascii_case(b"connection") {
            self.head.keep_alive = self
                .bytes(value)
                .split(|&b| b == b',')
                .any(|token| trim_bytes(token).eq_ignore_ascii_case(b"keep-alive"));
        } else if name.eq_ignore_ascii_case(b"content-length") {
            self.head.content_length =
                parse_decimal(self.bytes(value)).ok_or(ParseError::BadContentLength)?;
        }
        Ok(())
    }

    fn parse_host(&mut self, value: Span) -> Result<(), ParseError> {
        let bytes = self.bytes(value);
        // A colon inside `[...]` belongs to an IPv6 literal.
        let split = bytes
            .iter()
            .rposition(|&b| b == b':')
            .filter(|&c| !bytes[c..].contains(&b']'));

        match split {
            Some(c) => {
                let port = parse_decimal(&bytes[c + 1..])
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or(ParseError::BadHost)?;
                self.head.host = Some(Span {
                    start: value.start,
                    end: value.start + c,
                });
                self.head.port = Some(port);
            }
            None => {
                self.head.host = Some(value);
                self.head.port = None;
            }
        }
        Ok(())
    }

    #[inline]
    fn bytes(&self, span: Span) -> &[u8] {
        &self.buf[span.start..span.end]
    }

    fn trim(&self, mut span: Span) -> Span {
        while span.start < span.end && is_blank(self.buf[span.start]) {
            span.start += 1;
        }
        while span.end > span.start && is_blank(self.buf[span.end - 1]) {
            span.end -= 1;
        }
        span
    }

    // Spans are only handed out while they lie inside the filled region.
    fn text(&self, span: Option<Span>) -> Option<&str> {
        let span = span?;
        if span.end > self.read_len || span.start > span.end {
            return None;
        }
        std::str::from_utf8(self.bytes(span)).ok()
    }

    pub fn method(&self) -> Option<Method> {
        self.head.method
    }

    /// Raw request target as sent.
    pub fn target(&self) -> Option<&str> {
        self.text(self.head.target)
    }

    /// Absolute path, without scheme, authority or query.
    pub fn path(&self) -> Option<&str> {
        self.text(self.head.path)
    }

    pub fn query(&self) -> Option<&str> {
        self.text(self.head.query)
    }

    pub fn version(&self) -> Option<&str> {
        self.text(self.head.version)
    }

    pub fn host(&self) -> Option<&str> {
        self.text(self.head.host)
    }

    pub fn port(&self) -> Option<u16> {
        self.head.port
    }

    pub fn keep_alive(&self) -> bool {
        self.head.keep_alive
    }

    pub fn content_length(&self) -> usize {
        self.head.content_length
    }
}

#[inline]
fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

fn trim_bytes(mut b: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = b {
        if !is_blank(*first) {
            break;
        }
        b = rest;
    }
    while let [rest @ .., last] = b {
        if !is_blank(*last) {
            break;
        }
        b = rest;
    }
    b
}

fn parse_decimal(b: &[u8]) -> Option<usize> {
    if b.is_empty() || !b.iter().all(u8::is_ascii_digit) {
        return None;
    }
    b.iter().try_fold(0usize, |acc, d| {
        acc.checked_mul(10)?.checked_add(usize::from(d - b'0'))
    })
}
