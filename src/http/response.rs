//! HTTP/1.1 responses and their wire serialization.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::{Headers, StatusCode};

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use prerender::http::{Response, StatusCode};
///
/// let response = Response::html("<html></html>")
///     .header("Server-Timing", "Prerender;dur=42");
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Type: text/html; charset=utf-8\r\n"));
/// assert!(text.contains("Content-Length: 13\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    keep_alive: bool,
    head_only: bool,
}

impl Response {
    /// An empty response with `status`.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            keep_alive: true,
            head_only: false,
        }
    }

    /// `200` with an HTML body.
    pub fn html(body: impl Into<String>) -> Self {
        Self::new(StatusCode::Ok)
            .header("Content-Type", "text/html; charset=utf-8")
            .body(body.into())
    }

    /// `200` with `value` serialized as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::new(StatusCode::Ok)
                .header("Content-Type", "application/json; charset=utf-8")
                .body(body),
            Err(e) => Self::error(StatusCode::InternalServerError, e.to_string()),
        }
    }

    /// Plain-text error page: the reason phrase, then `detail` on its own line.
    pub fn error(status: StatusCode, detail: impl AsRef<str>) -> Self {
        let detail = detail.as_ref();
        let text = if detail.is_empty() {
            format!("{}\n", status.canonical_reason())
        } else {
            format!("{}\n{detail}\n", status.canonical_reason())
        };
        Self::new(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(text)
    }

    /// Sets a header, replacing any earlier value under the same name.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Answer to a `HEAD` request: headers and `Content-Length` as for `GET`,
    /// no body bytes.
    #[must_use]
    pub fn head_only(mut self) -> Self {
        self.head_only = true;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// Serializes the status line, headers, `Connection`, `Content-Length`
    /// and body.
    pub fn into_bytes(self) -> BytesMut {
        let content_length = self.body.len();
        let connection = if self.keep_alive { "keep-alive" } else { "close" };

        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 64 + content_length);
        buf.put(format!("HTTP/1.1 {}\r\n", self.status).as_bytes());
        buf.put(self.headers.to_string().as_bytes());
        buf.put(format!("Connection: {connection}\r\n").as_bytes());
        buf.put(format!("Content-Length: {content_length}\r\n\r\n").as_bytes());
        if !self.head_only {
            buf.put(self.body);
        }
        buf
    }
}
