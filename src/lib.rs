//! # prerender
//!
//! Server-side prerendering of client-rendered pages through a headless
//! browser.
//!
//! A [`Renderer`] loads a page in the engine, lets its scripts build the DOM,
//! waits for network quiescence plus an application marker, optionally inlines
//! same-origin stylesheets, and returns the serialized DOM. Snapshots are
//! cached per URL for the life of the process.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "chromium")]
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//!
//! use prerender::engine::chromium::{ChromiumEngine, LaunchOptions};
//! use prerender::{FilterRules, MemoryCache, RenderOptions, Renderer};
//!
//! let renderer = Renderer::new(
//!     ChromiumEngine::new(LaunchOptions::default()),
//!     Arc::new(MemoryCache::new()),
//!     RenderOptions::default(),
//!     FilterRules::default(),
//! );
//! let result = renderer.render("http://localhost:8080/index.html", None).await?;
//! println!("{} ({}ms)", result.html, result.elapsed_ms);
//! # Ok(())
//! # }
//! ```

// ── Render pipeline ───────────────────────────────────────────────────────────
pub mod cache;
pub mod completion;
pub mod engine;
pub mod filter;
pub mod inline;
pub mod render;

// ── Front-end ─────────────────────────────────────────────────────────────────
pub mod app;
pub mod config;
pub mod context;
pub mod http;
pub mod router;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use app::{App, EngineMode};
pub use cache::{CacheStore, MemoryCache};
pub use config::{Config, ConfigError};
pub use engine::{EngineEndpoint, EngineError};
pub use filter::{FilterRules, ResourceKind, SyntheticResponse};
pub use http::{Request, Response, StatusCode};
pub use render::{RenderError, RenderOptions, RenderResult, Renderer};
pub use server::{Server, ServerError};
