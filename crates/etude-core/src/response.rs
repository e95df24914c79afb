// src/response.rs
use crate::error::{EtudeError, EtudeResult};
use crate::http::{CONTENT_TYPE, Status};
use std::time::SystemTime;

/// Appends response bytes to a fixed write buffer, failing instead of
/// truncating when something does not fit.
pub struct ResponseWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn push(&mut self, bytes: &[u8]) -> EtudeResult<()> {
        let end = self.len + bytes.len();
        if end > self.buf.len() {
            return Err(EtudeError::WriteBufferOverflow {
                capacity: self.buf.len(),
            });
        }
        self.buf[self.len..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }

    pub fn status_line(&mut self, status: Status) -> EtudeResult<()> {
        let mut code = itoa::Buffer::new();
        self.push(b"HTTP/1.1 ")?;
        self.push(code.format(status.code()).as_bytes())?;
        self.push(b" ")?;
        self.push(status.reason().as_bytes())?;
        self.push(b"\r\n")
    }

    /// Content-Length, Connection, Content-Type, Date and the blank line.
    pub fn headers(&mut self, content_length: usize, keep_alive: bool) -> EtudeResult<()> {
        let mut len = itoa::Buffer::new();
        self.push(b"Content-Length: ")?;
        self.push(len.format(content_length).as_bytes())?;
        let connection: &[u8] = if keep_alive { b"keep-alive" } else { b"close" };
        self.push(b"\r\nConnection: ")?;
        self.push(connection)?;
        self.push(b"\r\nContent-Type: ")?;
        self.push(CONTENT_TYPE.as_bytes())?;
        self.push(b"\r\nDate: ")?;
        self.push(httpdate::fmt_http_date(SystemTime::now()).as_bytes())?;
        self.push(b"\r\n\r\n")
    }

    pub fn body(&mut self, body: &[u8]) -> EtudeResult<()> {
        self.push(body)
    }
}

/// Status line and headers for a body that is sent from elsewhere.
pub fn write_head(
    buf: &mut [u8],
    status: Status,
    content_length: usize,
    keep_alive: bool,
) -> EtudeResult<usize> {
    let mut w = ResponseWriter::new(buf);
    w.status_line(status)?;
    w.headers(content_length, keep_alive)?;
    Ok(w.len())
}

/// A complete response carrying the status's canned body.
pub fn write_canned(buf: &mut [u8], status: Status, keep_alive: bool) -> EtudeResult<usize> {
    let body = status.canned_body();
    let mut w = ResponseWriter::new(buf);
    w.status_line(status)?;
    w.headers(body.len(), keep_alive)?;
    w.body(body.as_bytes())?;
    Ok(w.len())
}
