//! Per-request context handed to route handlers.

use crate::http::{Method, Request};

/// The request plus what the router learned while matching it.
#[derive(Debug)]
pub struct Context {
    request: Request,
    tail: String,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            tail: String::new(),
        }
    }

    /// Context for a prefix route; `tail` is the part of the path after the
    /// prefix, starting with `/`.
    pub fn with_tail(request: Request, tail: impl Into<String>) -> Self {
        Self {
            request,
            tail: tail.into(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    /// Path remainder matched by a prefix route; empty for exact routes.
    pub fn tail(&self) -> &str {
        &self.tail
    }

    pub fn is_head(&self) -> bool {
        *self.request.method() == Method::Head
    }
}
