//! TOML configuration for the prerender server.
//!
//! Every section implements `Default`, so a missing file, a missing section or
//! a missing key all fall back to the built-in values.
//!
//! ## Search order
//!
//! 1. `PRERENDER_CONFIG` environment variable
//! 2. `./prerender.toml`
//! 3. No file found → `Config::default()`

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::EngineEndpoint;
use crate::filter::{FilterRules, ResourceKind, SyntheticResponse};
use crate::render::RenderOptions;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "PRERENDER_CONFIG";

/// Config file looked up in the working directory.
pub const CONFIG_FILE: &str = "prerender.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("synthetic rule for `{url_suffix}` needs exactly one of `body` or `body_file`")]
    SyntheticBody { url_suffix: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub render: RenderConfig,
    pub filter: FilterConfig,
}

/// HTTP front-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Directory served for every path without a dedicated route.
    pub public_dir: PathBuf,
    /// Page prerendered for `GET /`.
    pub render_path: String,
    /// Authority the page is rendered from. When unset, the request's `Host`
    /// header is used, so any client can point renders at any host.
    pub public_host: Option<String>,
}

/// Headless engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// DevTools endpoint of an engine started elsewhere. Takes precedence
    /// over `shared`.
    pub endpoint: Option<String>,
    /// Launch one engine on first use and keep it for every later render.
    /// When off, every render launches and tears down its own engine.
    pub shared: bool,
    pub executable: Option<PathBuf>,
    pub no_sandbox: bool,
    pub args: Vec<String>,
}

/// Render pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub marker: String,
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub inline_stylesheets: bool,
    pub coalesce: bool,
}

/// Request interception.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub allow: Vec<ResourceKind>,
    pub synthetic: Vec<SyntheticConfig>,
}

/// One `[[filter.synthetic]]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    pub url_suffix: String,
    #[serde(default = "default_status")]
    pub status: u16,
    pub content_type: String,
    #[serde(default)]
    pub body: Option<String>,
    /// Read relative to the working directory.
    #[serde(default)]
    pub body_file: Option<PathBuf>,
}

fn default_status() -> u16 {
    200
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            public_dir: PathBuf::from("public"),
            render_path: "/index.html".to_owned(),
            public_host: None,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            shared: true,
            executable: None,
            no_sandbox: false,
            args: Vec::new(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        let options = RenderOptions::default();
        Self {
            marker: options.marker,
            timeout_ms: duration_ms(options.timeout),
            poll_interval_ms: duration_ms(options.poll_interval),
            inline_stylesheets: options.inline_stylesheets,
            coalesce: options.coalesce,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            allow: vec![
                ResourceKind::Document,
                ResourceKind::Script,
                ResourceKind::Xhr,
                ResourceKind::Fetch,
            ],
            synthetic: Vec::new(),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Loads the config file. Never fails: an unreadable or invalid file is
    /// logged and replaced by the defaults.
    pub fn load() -> Self {
        let Some(path) = find_config_path() else {
            info!("no config file found, using defaults");
            return Self::default();
        };
        match Self::from_file(&path) {
            Ok(config) => {
                info!(path = %path.display(), "configuration loaded");
                config
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "invalid config, using defaults");
                Self::default()
            }
        }
    }

    /// Reads and parses one config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown values.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

impl EngineConfig {
    /// The configured external endpoint, if any.
    pub fn external_endpoint(&self) -> Option<EngineEndpoint> {
        self.endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .map(EngineEndpoint::new)
    }

    #[cfg(feature = "chromium")]
    pub fn launch_options(&self) -> crate::engine::chromium::LaunchOptions {
        crate::engine::chromium::LaunchOptions {
            executable: self.executable.clone(),
            no_sandbox: self.no_sandbox,
            args: self.args.clone(),
        }
    }
}

impl RenderConfig {
    pub fn options(&self) -> RenderOptions {
        RenderOptions {
            marker: self.marker.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            inline_stylesheets: self.inline_stylesheets,
            coalesce: self.coalesce,
        }
    }
}

impl FilterConfig {
    /// Builds filter rules, reading any `body_file` from disk.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] for an unreadable body file and
    /// [`ConfigError::SyntheticBody`] for a rule with zero or two bodies.
    pub fn rules(&self) -> Result<FilterRules, ConfigError> {
        let mut rules = FilterRules::new(self.allow.iter().copied());
        for rule in &self.synthetic {
            let body = match (&rule.body, &rule.body_file) {
                (Some(body), None) => Bytes::from(body.clone()),
                (None, Some(path)) => {
                    Bytes::from(fs::read(path).map_err(|source| ConfigError::Read {
                        path: path.clone(),
                        source,
                    })?)
                }
                _ => {
                    return Err(ConfigError::SyntheticBody {
                        url_suffix: rule.url_suffix.clone(),
                    });
                }
            };
            rules.synthesize(SyntheticResponse::new(
                rule.url_suffix.clone(),
                rule.status,
                rule.content_type.clone(),
                body,
            ));
        }
        Ok(rules)
    }
}

fn find_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        let p = PathBuf::from(path);
        if p.is_file() {
            return Some(p);
        }
        warn!(path = %p.display(), "{CONFIG_ENV} does not name a file");
    }

    let p = PathBuf::from(CONFIG_FILE);
    p.is_file().then_some(p)
}
