//! Stylesheet inlining: makes the snapshot independent of external CSS.
//!
//! While the page loads, every response is reported to the render. After the
//! page is ready, the bodies of same-origin stylesheet responses are pulled
//! into a [`StylesheetCapture`]; then each `link[rel="stylesheet"]` whose
//! resolved href has a captured body is swapped for an inline `<style>`.
//! Links without a capture stay as they are.

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};
use url::{Origin, Url};

use crate::engine::{EngineError, ObservedResponse, Page};
use crate::filter::{ResourceKind, is_same_origin};

/// Stylesheet bodies captured during one render, keyed by response URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StylesheetCapture {
    bodies: HashMap<String, String>,
}

impl StylesheetCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for responses whose bodies belong in the capture.
    pub fn wants(origin: &Origin, response: &ObservedResponse) -> bool {
        response.kind == ResourceKind::Stylesheet && is_same_origin(origin, &response.url)
    }

    pub fn insert(&mut self, url: impl Into<String>, css: impl Into<String>) {
        self.bodies.insert(url.into(), css.into());
    }

    pub fn get(&self, url: &str) -> Option<&str> {
        self.bodies.get(url).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    /// Drains the responses reported so far and fetches the body of each
    /// same-origin stylesheet among them.
    ///
    /// A body the engine no longer holds is skipped; its link stays external.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Closed`] if the page went away mid-capture.
    pub async fn collect<P: Page>(
        page: &mut P,
        page_url: &Url,
        responses: &mut UnboundedReceiver<ObservedResponse>,
    ) -> Result<Self, EngineError> {
        let origin = page_url.origin();
        let mut capture = Self::new();

        while let Ok(response) = responses.try_recv() {
            if !Self::wants(&origin, &response) {
                continue;
            }
            match page.response_body(&response.request_id).await {
                Ok(css) => capture.insert(response.url, css),
                Err(EngineError::Closed) => return Err(EngineError::Closed),
                Err(e) => warn!(url = %response.url, error = %e, "stylesheet body unavailable"),
            }
        }

        debug!(count = capture.len(), "stylesheets captured");
        Ok(capture)
    }
}

/// Replaces captured stylesheet links in `page` with inline styles.
///
/// Returns the number of links replaced.
///
/// # Errors
///
/// Propagates engine failures reading or mutating the DOM.
pub async fn inline_stylesheets<P: Page>(
    page: &mut P,
    capture: &StylesheetCapture,
) -> Result<usize, EngineError> {
    if capture.is_empty() {
        return Ok(0);
    }

    let mut replaced = 0;
    for href in page.stylesheet_links().await? {
        if let Some(css) = capture.get(&href) {
            replaced += page.replace_stylesheet(&href, css).await?;
        }
    }

    debug!(replaced, "stylesheets inlined");
    Ok(replaced)
}
