//! Render orchestration: one URL in, one HTML snapshot out.
//!
//! [`Renderer::render`] runs the whole pipeline:
//!
//! ```text
//! Idle -> SessionAcquiring -> Navigating -> WaitingForCompletion
//!      -> Extracting -> Done
//!                    \-> Failed
//! ```
//!
//! A cache hit short-circuits everything and reports `elapsed_ms == 0`. The
//! engine session is closed on every path before `render` returns, and only a
//! fully successful render is written to the cache. There are no retries here;
//! retry policy belongs to the caller.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStore, cache_key};
use crate::completion::CompletionDetector;
use crate::engine::{
    Engine, EngineEndpoint, EngineError, EnginePool, EngineSession, ObservedResponse, Page,
    PageHooks,
};
use crate::filter::{FilterRules, RequestFilter, ResourceKind};
use crate::inline::{StylesheetCapture, inline_stylesheets};

/// Errors surfaced by [`Renderer::render`].
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid render url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("engine unavailable: {0}")]
    EngineLaunch(#[source] EngineError),

    #[error("navigation to {url} failed: {source}")]
    Navigation {
        url: String,
        #[source]
        source: EngineError,
    },

    #[error("page.goto/waitForSelector timed out after {}ms for {url}", .timeout.as_millis())]
    NavigationTimeout { url: String, timeout: Duration },

    #[error("failed to extract snapshot of {url}: {source}")]
    Extraction {
        url: String,
        #[source]
        source: EngineError,
    },
}

/// A rendered snapshot and how long producing it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderResult {
    pub html: String,
    /// Zero exactly when the snapshot came from the cache.
    pub elapsed_ms: u64,
}

impl RenderResult {
    pub fn from_cache(&self) -> bool {
        self.elapsed_ms == 0
    }

    /// `Server-Timing` header value describing the render.
    ///
    /// # Examples
    ///
    /// ```
    /// use prerender::render::RenderResult;
    ///
    /// let result = RenderResult { html: String::new(), elapsed_ms: 742 };
    /// assert_eq!(
    ///     result.server_timing(),
    ///     r#"Prerender;dur=742;desc="Headless render time (ms)""#
    /// );
    /// ```
    pub fn server_timing(&self) -> String {
        format!(
            r#"Prerender;dur={};desc="Headless render time (ms)""#,
            self.elapsed_ms
        )
    }
}

/// Render pipeline states, logged as a render advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    Idle,
    SessionAcquiring,
    Navigating,
    WaitingForCompletion,
    Extracting,
    Done,
    Failed,
}

impl RenderState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for RenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::SessionAcquiring => "session-acquiring",
            Self::Navigating => "navigating",
            Self::WaitingForCompletion => "waiting-for-completion",
            Self::Extracting => "extracting",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tuning for a [`Renderer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    /// Selector whose presence confirms the page's primary content mounted.
    pub marker: String,
    /// Bound on navigation plus completion detection.
    pub timeout: Duration,
    /// How often the marker selector is probed.
    pub poll_interval: Duration,
    /// Inline same-origin stylesheets into the snapshot. Turning this on also
    /// admits stylesheet requests through the filter so there is CSS to capture.
    pub inline_stylesheets: bool,
    /// Serialize concurrent renders of the same uncached URL.
    pub coalesce: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            marker: "#posts".to_owned(),
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            inline_stylesheets: false,
            coalesce: false,
        }
    }
}

/// Per-URL gates used when coalescing is on.
type Gates = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Drives the render pipeline against an [`Engine`].
pub struct Renderer<E: Engine> {
    pool: EnginePool<E>,
    cache: Arc<dyn CacheStore>,
    rules: Arc<FilterRules>,
    detector: CompletionDetector,
    inline_stylesheets: bool,
    gates: Option<Gates>,
}

impl<E: Engine> Renderer<E> {
    pub fn new(
        engine: E,
        cache: Arc<dyn CacheStore>,
        options: RenderOptions,
        mut rules: FilterRules,
    ) -> Self {
        if options.inline_stylesheets && !rules.is_allowed(ResourceKind::Stylesheet) {
            debug!("stylesheet inlining enabled, admitting stylesheet requests");
            rules.allow(ResourceKind::Stylesheet);
        }
        Self {
            pool: EnginePool::new(engine),
            cache,
            rules: Arc::new(rules),
            detector: CompletionDetector::new(
                options.marker,
                options.timeout,
                options.poll_interval,
            ),
            inline_stylesheets: options.inline_stylesheets,
            gates: options.coalesce.then(Gates::default),
        }
    }

    pub fn pool(&self) -> &EnginePool<E> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// Renders `url`, serving from the cache when possible.
    ///
    /// With `endpoint` the render attaches to that running engine; without it
    /// a fresh engine is launched for this render alone.
    ///
    /// # Errors
    ///
    /// - [`RenderError::InvalidUrl`]: `url` is not an absolute URL.
    /// - [`RenderError::EngineLaunch`]: no engine could be started or reached.
    /// - [`RenderError::Navigation`]: the engine failed while loading the page.
    /// - [`RenderError::NavigationTimeout`]: the page never became ready.
    /// - [`RenderError::Extraction`]: inlining or serialization failed.
    pub async fn render(
        &self,
        url: &str,
        endpoint: Option<&EngineEndpoint>,
    ) -> Result<RenderResult, RenderError> {
        let url = Url::parse(url).map_err(|source| RenderError::InvalidUrl {
            url: url.to_owned(),
            source,
        })?;
        let key = cache_key(&url);

        if let Some(hit) = self.cached(&key) {
            return Ok(hit);
        }

        let Some(gates) = &self.gates else {
            return self.render_uncached(&url, &key, endpoint).await;
        };

        let gate = Arc::clone(
            gates
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(key.clone())
                .or_default(),
        );
        let result = {
            let _turn = gate.lock().await;
            match self.cached(&key) {
                Some(hit) => Ok(hit),
                None => self.render_uncached(&url, &key, endpoint).await,
            }
        };

        let mut gates = gates.lock().unwrap_or_else(PoisonError::into_inner);
        // one reference in the map, one here: nobody else is waiting
        if Arc::strong_count(&gate) <= 2 {
            gates.remove(&key);
        }
        result
    }

    fn cached(&self, key: &str) -> Option<RenderResult> {
        let html = self.cache.lookup(key)?;
        debug!(url = %key, "render cache hit");
        Some(RenderResult {
            html,
            elapsed_ms: 0,
        })
    }

    async fn render_uncached(
        &self,
        url: &Url,
        key: &str,
        endpoint: Option<&EngineEndpoint>,
    ) -> Result<RenderResult, RenderError> {
        let start = Instant::now();
        let mut state = RenderState::Idle;
        info!(%url, "headless render started");

        advance(&mut state, RenderState::SessionAcquiring, url);
        let mut session = match self.pool.acquire(endpoint).await {
            Ok(session) => session,
            Err(e) => {
                advance(&mut state, RenderState::Failed, url);
                return Err(e);
            }
        };

        let outcome = self.drive(&mut session, url, &mut state).await;

        if let Err(e) = session.close().await {
            warn!(%url, error = %e, "failed to close engine session");
        }

        let html = match outcome {
            Ok(html) => html,
            Err(e) => {
                advance(&mut state, RenderState::Failed, url);
                warn!(%url, error = %e, "headless render failed");
                return Err(e);
            }
        };

        // a real render always reports a non-zero duration
        let elapsed_ms = u64::try_from(start.elapsed().as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        self.cache.store(key, html.clone());
        advance(&mut state, RenderState::Done, url);
        info!(%url, elapsed_ms, "headless rendered page");

        Ok(RenderResult { html, elapsed_ms })
    }

    /// Everything between acquiring and releasing the session.
    async fn drive(
        &self,
        session: &mut EngineSession<E::Browser>,
        url: &Url,
        state: &mut RenderState,
    ) -> Result<String, RenderError> {
        let (activity_tx, mut activity_rx) = mpsc::unbounded_channel();
        let (responses_tx, mut responses_rx) = mpsc::unbounded_channel();
        let hooks = PageHooks {
            filter: Arc::new(RequestFilter::new(Arc::clone(&self.rules), url)),
            activity: activity_tx,
            responses: responses_tx,
        };

        advance(state, RenderState::Navigating, url);
        let page = session
            .open_page(hooks)
            .await
            .map_err(|source| RenderError::Navigation {
                url: url.to_string(),
                source,
            })?;

        advance(state, RenderState::WaitingForCompletion, url);
        self.detector
            .navigate_and_wait(page, url, &mut activity_rx)
            .await?;

        advance(state, RenderState::Extracting, url);
        extract(page, url, self.inline_stylesheets, &mut responses_rx)
            .await
            .map_err(|source| RenderError::Extraction {
                url: url.to_string(),
                source,
            })
    }
}

async fn extract<P: Page>(
    page: &mut P,
    url: &Url,
    inline: bool,
    responses: &mut mpsc::UnboundedReceiver<ObservedResponse>,
) -> Result<String, EngineError> {
    if inline {
        let capture = StylesheetCapture::collect(page, url, responses).await?;
        inline_stylesheets(page, &capture).await?;
    }
    page.content().await
}

fn advance(state: &mut RenderState, next: RenderState, url: &Url) {
    debug!(%url, from = %state, to = %next, "render state");
    *state = next;
}
