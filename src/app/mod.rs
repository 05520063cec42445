//! The prerender front-end: routes, the demo data endpoint and static files.
//!
//! `GET /` prerenders the configured page and attaches the render time as a
//! `Server-Timing` header. `GET /posts` serves the data the demo page renders
//! client-side. Every other path is a static file under the public directory.
//!
//! The page is rendered from `server.public_host` when set. Otherwise the
//! request's `Host` header picks the authority, which lets any client make the
//! engine fetch an arbitrary host and add an entry to the unbounded cache.
//! Set `public_host` whenever the server is reachable by untrusted clients.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{EngineConfig, ServerConfig};
use crate::context::Context;
use crate::engine::{Engine, EngineEndpoint, SharedEngine};
use crate::http::{Response, StatusCode};
use crate::render::{RenderError, RenderResult, Renderer};
use crate::router::Router;

/// Where renders get their engine from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineMode {
    /// Attach to an engine started outside this process.
    External(EngineEndpoint),
    /// Launch one engine on first use and attach every render to it.
    Shared,
    /// Launch and tear down an engine per render.
    PerRender,
}

impl From<&EngineConfig> for EngineMode {
    fn from(config: &EngineConfig) -> Self {
        match config.external_endpoint() {
            Some(endpoint) => Self::External(endpoint),
            None if config.shared => Self::Shared,
            None => Self::PerRender,
        }
    }
}

/// One entry of the demo `/posts` feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Post {
    pub title: &'static str,
    pub summary: &'static str,
    pub content: &'static str,
}

pub const POSTS: [Post; 3] = [
    Post {
        title: "Post #1",
        summary: "This is summary for first post",
        content: "This is content of first post",
    },
    Post {
        title: "Post #2",
        summary: "This is summary for second post",
        content: "This is content of second post",
    },
    Post {
        title: "Post #3",
        summary: "This is summary for third post",
        content: "This is content of third post",
    },
];

pub struct App<E: Engine> {
    renderer: Renderer<E>,
    mode: EngineMode,
    shared: Mutex<Option<SharedEngine<E::Browser>>>,
    public_dir: PathBuf,
    render_path: String,
    public_host: Option<String>,
}

impl<E: Engine> App<E> {
    pub fn new(renderer: Renderer<E>, server: &ServerConfig, mode: EngineMode) -> Self {
        Self {
            renderer,
            mode,
            shared: Mutex::new(None),
            public_dir: server.public_dir.clone(),
            render_path: server.render_path.clone(),
            public_host: server.public_host.clone().filter(|h| !h.is_empty()),
        }
    }

    pub fn renderer(&self) -> &Renderer<E> {
        &self.renderer
    }

    /// Builds the route table. The app is shared by every handler.
    pub fn router(self: &Arc<Self>) -> Router {
        let mut router = Router::new();

        let app = Arc::clone(self);
        router.get("/", move |ctx: Context| {
            let app = Arc::clone(&app);
            async move { app.index(&ctx).await }
        });

        router.get("/posts", |_ctx: Context| async { Response::json(&POSTS) });

        let app = Arc::clone(self);
        router.get("/*", move |ctx: Context| {
            let app = Arc::clone(&app);
            async move { app.static_file(ctx.tail()).await }
        });

        router
    }

    /// Renders `url` on the engine selected by the app's [`EngineMode`].
    ///
    /// # Errors
    ///
    /// Propagates [`Renderer::render`] failures, including failure to launch
    /// the shared engine.
    pub async fn prerender(&self, url: &str) -> Result<RenderResult, RenderError> {
        match &self.mode {
            EngineMode::External(endpoint) => self.renderer.render(url, Some(endpoint)).await,
            EngineMode::PerRender => self.renderer.render(url, None).await,
            EngineMode::Shared => {
                let endpoint = self.shared_endpoint().await?;
                let result = self.renderer.render(url, Some(&endpoint)).await;
                if matches!(result, Err(RenderError::EngineLaunch(_))) {
                    self.discard_shared(&endpoint).await;
                }
                result
            }
        }
    }

    /// Closes the shared engine, if one was launched.
    pub async fn shutdown(&self) {
        if let Some(shared) = self.shared.lock().await.take() {
            if let Err(e) = shared.close().await {
                warn!(error = %e, "failed to close shared engine");
            }
        }
    }

    async fn shared_endpoint(&self) -> Result<EngineEndpoint, RenderError> {
        let mut shared = self.shared.lock().await;
        if let Some(engine) = shared.as_ref() {
            return Ok(engine.endpoint().clone());
        }
        let engine = self.renderer.pool().launch_shared().await?;
        let endpoint = engine.endpoint().clone();
        *shared = Some(engine);
        Ok(endpoint)
    }

    /// Drops a shared engine that can no longer be attached to, so the next
    /// render launches a fresh one.
    async fn discard_shared(&self, endpoint: &EngineEndpoint) {
        let mut shared = self.shared.lock().await;
        if shared.as_ref().is_some_and(|e| e.endpoint() == endpoint) {
            warn!(%endpoint, "shared engine unreachable, relaunching on next render");
            if let Some(engine) = shared.take() {
                if let Err(e) = engine.close().await {
                    debug!(error = %e, "closing unreachable shared engine failed");
                }
            }
        }
    }

    async fn index(&self, ctx: &Context) -> Response {
        let Some(host) = self.public_host.as_deref().or_else(|| ctx.request().host()) else {
            return Response::error(StatusCode::BadRequest, "missing Host header");
        };
        let url = format!("http://{host}{}", self.render_path);

        match self.prerender(&url).await {
            Ok(result) => {
                let timing = result.server_timing();
                Response::html(result.html).header("Server-Timing", timing)
            }
            Err(e) => {
                let status = render_error_status(&e);
                warn!(%url, status = status.as_u16(), error = %e, "prerender failed");
                Response::error(status, render_error_reason(&e))
            }
        }
    }

    async fn static_file(&self, tail: &str) -> Response {
        let Some(path) = resolve_public_path(&self.public_dir, tail) else {
            debug!(path = tail, "rejected static path");
            return Response::error(StatusCode::NotFound, "");
        };

        match tokio::fs::read(&path).await {
            Ok(body) => Response::new(StatusCode::Ok)
                .header("Content-Type", content_type(&path))
                .body(body),
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::IsADirectory) => {
                Response::error(StatusCode::NotFound, "")
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read static file");
                Response::error(StatusCode::InternalServerError, "")
            }
        }
    }
}

/// Maps a failed render onto the status the client sees.
pub fn render_error_status(err: &RenderError) -> StatusCode {
    match err {
        RenderError::NavigationTimeout { .. } => StatusCode::GatewayTimeout,
        RenderError::EngineLaunch(_) => StatusCode::BadGateway,
        _ => StatusCode::InternalServerError,
    }
}

/// Short reason sent to the client; the full error only goes to the log.
fn render_error_reason(err: &RenderError) -> &'static str {
    match err {
        RenderError::NavigationTimeout { .. } => "render timed out",
        RenderError::EngineLaunch(_) => "headless engine unavailable",
        _ => "render failed",
    }
}

/// Joins a request path onto `root`. `None` for paths that would leave it.
fn resolve_public_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in request_path.split('/').filter(|s| !s.is_empty() && *s != ".") {
        if segment == ".." || segment.contains('\\') || segment.contains('\0') {
            return None;
        }
        path.push(segment);
    }
    if request_path.is_empty() || request_path.ends_with('/') {
        path.push("index.html");
    }
    Some(path)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") => "application/json; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
