//! Headless browser engine abstraction.
//!
//! The render pipeline talks to the browser only through the traits in this
//! module:
//!
//! - [`Engine`]: starts a fresh engine process or attaches to a running one.
//! - [`Browser`]: a connected engine; opens pages and is closed or
//!   disconnected when the render is done with it.
//! - [`Page`]: one isolated page context.
//!
//! Per-render plumbing travels in [`PageHooks`]: the [`RequestFilter`] the
//! backend must consult for every intercepted request, and two event sinks
//! feeding completion detection and stylesheet capture.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use url::Url;

use crate::filter::{RequestFilter, ResourceKind};

pub mod pool;

#[cfg(feature = "chromium")]
pub mod chromium;

#[cfg(test)]
pub(crate) mod testing;

pub use pool::{EnginePool, EngineSession, Ownership, SharedEngine};

/// Errors raised by an engine backend.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch engine: {0}")]
    Launch(String),

    #[error("failed to attach to engine at {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("engine protocol error: {0}")]
    Protocol(String),

    #[error("engine connection closed")]
    Closed,
}

/// Reference to a running engine that later renders can attach to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineEndpoint(String);

impl EngineEndpoint {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self(endpoint.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EngineEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network lifecycle signal used to detect quiescence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkActivity {
    /// A request with this id was issued.
    Started(String),
    /// The request with this id completed or failed.
    Finished(String),
}

/// A response the page received, reported as it arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedResponse {
    /// Backend id used to fetch the body later via [`Page::response_body`].
    pub request_id: String,
    pub url: String,
    pub kind: ResourceKind,
}

/// Per-render hooks installed when a page is opened.
#[derive(Debug, Clone)]
pub struct PageHooks {
    pub filter: Arc<RequestFilter>,
    pub activity: UnboundedSender<NetworkActivity>,
    pub responses: UnboundedSender<ObservedResponse>,
}

/// A headless engine backend.
pub trait Engine: Send + Sync + 'static {
    type Browser: Browser;

    /// Starts a new, isolated engine process.
    fn launch(&self) -> impl Future<Output = Result<Self::Browser, EngineError>> + Send;

    /// Attaches to the engine process behind `endpoint`.
    fn connect(
        &self,
        endpoint: &EngineEndpoint,
    ) -> impl Future<Output = Result<Self::Browser, EngineError>> + Send;
}

/// A connected engine.
pub trait Browser: Send + 'static {
    type Page: Page;

    /// Endpoint other renders can use to attach to this engine.
    fn endpoint(&self) -> EngineEndpoint;

    /// Opens a fresh page context with interception and event reporting wired
    /// to `hooks`.
    fn open_page(
        &mut self,
        hooks: PageHooks,
    ) -> impl Future<Output = Result<Self::Page, EngineError>> + Send;

    /// Terminates the engine process.
    fn close(self) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Drops the connection, leaving the engine process running.
    fn disconnect(self) -> impl Future<Output = Result<(), EngineError>> + Send;
}

/// One page context inside a [`Browser`].
pub trait Page: Send {
    /// Navigates to `url`, resolving once the main document has loaded.
    fn goto(&mut self, url: &Url) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Returns `true` if `selector` currently matches an element.
    fn has_selector(
        &mut self,
        selector: &str,
    ) -> impl Future<Output = Result<bool, EngineError>> + Send;

    /// Resolved `href`s of every `link[rel="stylesheet"]` in the DOM.
    fn stylesheet_links(&mut self) -> impl Future<Output = Result<Vec<String>, EngineError>> + Send;

    /// Replaces each stylesheet link whose resolved href equals `href` with a
    /// `<style>` element holding `css`. Returns how many links were replaced.
    fn replace_stylesheet(
        &mut self,
        href: &str,
        css: &str,
    ) -> impl Future<Output = Result<usize, EngineError>> + Send;

    /// Body text of a response previously reported through
    /// [`PageHooks::responses`].
    fn response_body(
        &mut self,
        request_id: &str,
    ) -> impl Future<Output = Result<String, EngineError>> + Send;

    /// Serialized markup of the current DOM.
    fn content(&mut self) -> impl Future<Output = Result<String, EngineError>> + Send;

    /// Closes the page context.
    fn close(self) -> impl Future<Output = Result<(), EngineError>> + Send;
}
