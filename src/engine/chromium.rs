//! Chrome backend over the DevTools protocol, via `chromiumoxide`.
//!
//! Each opened page enables the Fetch domain for every URL, so Chrome pauses
//! each request until the page's [`RequestFilter`](crate::filter::RequestFilter)
//! answers it with fail, continue or fulfill. Network-domain events are
//! forwarded to the render as [`NetworkActivity`] and [`ObservedResponse`]s.
//!
//! Background tasks spawned per browser and per page are aborted when the
//! owning handle is closed.

use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chromiumoxide::{Handler, Page as CdpPage};
use chromiumoxide::browser::{Browser as CdpBrowser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, ContinueRequestParams, EventRequestPaused, FailRequestParams, FulfillRequestParams,
    HeaderEntry, RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{
    self, ErrorReason, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
    EventResponseReceived, GetResponseBodyParams,
};
use chromiumoxide::error::CdpError;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::{
    Browser, Engine, EngineEndpoint, EngineError, NetworkActivity, ObservedResponse, Page,
    PageHooks,
};
use crate::filter::{Decision, ResourceKind, SyntheticResponse};

/// How to start Chrome.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Chrome binary; located automatically when unset.
    pub executable: Option<PathBuf>,
    /// Pass `--no-sandbox` (needed when running as root in containers).
    pub no_sandbox: bool,
    /// Extra command-line switches.
    pub args: Vec<String>,
}

/// [`Engine`] that launches or attaches to headless Chrome.
#[derive(Debug, Clone, Default)]
pub struct ChromiumEngine {
    options: LaunchOptions,
}

impl ChromiumEngine {
    pub fn new(options: LaunchOptions) -> Self {
        Self { options }
    }

    fn browser_config(&self) -> Result<BrowserConfig, EngineError> {
        let mut builder = BrowserConfig::builder();
        if let Some(path) = &self.options.executable {
            builder = builder.chrome_executable(path);
        }
        if self.options.no_sandbox {
            builder = builder.no_sandbox();
        }
        for arg in &self.options.args {
            builder = builder.arg(arg.as_str());
        }
        builder.build().map_err(EngineError::Launch)
    }
}

impl Engine for ChromiumEngine {
    type Browser = ChromiumBrowser;

    async fn launch(&self) -> Result<ChromiumBrowser, EngineError> {
        let config = self.browser_config()?;
        let (browser, handler) = CdpBrowser::launch(config)
            .await
            .map_err(|e| EngineError::Launch(e.to_string()))?;
        debug!(endpoint = %browser.websocket_address(), "chrome launched");
        Ok(ChromiumBrowser::new(browser, handler))
    }

    async fn connect(&self, endpoint: &EngineEndpoint) -> Result<ChromiumBrowser, EngineError> {
        let (browser, handler) =
            CdpBrowser::connect(endpoint.as_str())
                .await
                .map_err(|e| EngineError::Connect {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })?;
        Ok(ChromiumBrowser::new(browser, handler))
    }
}

/// A connected Chrome instance.
pub struct ChromiumBrowser {
    browser: CdpBrowser,
    handler: JoinHandle<()>,
}

impl ChromiumBrowser {
    fn new(browser: CdpBrowser, mut handler: Handler) -> Self {
        // The handler stream drives the websocket; nothing happens unless it is polled.
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "devtools handler error");
                }
            }
        });
        Self { browser, handler }
    }
}

impl Browser for ChromiumBrowser {
    type Page = ChromiumPage;

    fn endpoint(&self) -> EngineEndpoint {
        EngineEndpoint::new(self.browser.websocket_address().clone())
    }

    async fn open_page(&mut self, hooks: PageHooks) -> Result<ChromiumPage, EngineError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(protocol)?;
        let mut page = ChromiumPage {
            page,
            tasks: Vec::with_capacity(3),
        };
        match page.install(hooks).await {
            Ok(()) => Ok(page),
            Err(e) => {
                if let Err(close_err) = page.close().await {
                    debug!(error = %close_err, "failed to close half-initialized page");
                }
                Err(e)
            }
        }
    }

    async fn close(mut self) -> Result<(), EngineError> {
        let closed = self.browser.close().await.map(drop).map_err(protocol);
        if let Err(e) = self.browser.wait().await {
            warn!(error = %e, "chrome did not exit cleanly");
        }
        self.handler.abort();
        closed
    }

    async fn disconnect(self) -> Result<(), EngineError> {
        self.handler.abort();
        Ok(())
    }
}

/// One Chrome tab.
pub struct ChromiumPage {
    page: CdpPage,
    tasks: Vec<JoinHandle<()>>,
}

impl ChromiumPage {
    /// Wires interception and event forwarding for `hooks`.
    async fn install(&mut self, hooks: PageHooks) -> Result<(), EngineError> {
        let page = &self.page;

        // Listeners go in before interception is switched on so no event is missed.
        let mut paused = page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(protocol)?;
        let mut started = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(protocol)?;
        let mut finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(protocol)?;
        let mut failed = page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(protocol)?;
        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(protocol)?;

        let intercept_page = page.clone();
        let filter = hooks.filter;
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let request =
                    filter.classify(resource_kind(&event.resource_type), &event.request.url);
                let id = event.request_id.clone();
                let answered = match filter.decide(&request) {
                    Decision::Abort => intercept_page
                        .execute(FailRequestParams::new(id, ErrorReason::BlockedByClient))
                        .await
                        .map(drop)
                        .map_err(protocol),
                    Decision::Continue => intercept_page
                        .execute(ContinueRequestParams::new(id))
                        .await
                        .map(drop)
                        .map_err(protocol),
                    Decision::Fulfill(synthetic) => fulfill(&intercept_page, id, synthetic).await,
                };
                if let Err(e) = answered {
                    debug!(url = %request.url, error = %e, "failed to answer paused request");
                }
            }
        }));

        let activity = hooks.activity;
        self.tasks.push(tokio::spawn(async move {
            loop {
                // biased: a request's start is always forwarded before its end
                let event = tokio::select! {
                    biased;
                    Some(e) = started.next() => NetworkActivity::Started(e.request_id.inner().clone()),
                    Some(e) = finished.next() => NetworkActivity::Finished(e.request_id.inner().clone()),
                    Some(e) = failed.next() => NetworkActivity::Finished(e.request_id.inner().clone()),
                    else => break,
                };
                if activity.send(event).is_err() {
                    break;
                }
            }
        }));

        let sink = hooks.responses;
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                let observed = ObservedResponse {
                    request_id: event.request_id.inner().clone(),
                    url: event.response.url.clone(),
                    kind: resource_kind(&event.r#type),
                };
                if sink.send(observed).is_err() {
                    break;
                }
            }
        }));

        let every_request = RequestPattern {
            url_pattern: Some("*".to_owned()),
            resource_type: None,
            request_stage: Some(RequestStage::Request),
        };
        self.page
            .execute(fetch::EnableParams {
                patterns: Some(vec![every_request]),
                handle_auth_requests: None,
            })
            .await
            .map_err(protocol)?;
        Ok(())
    }

    async fn evaluate<T: serde::de::DeserializeOwned>(
        &self,
        script: String,
    ) -> Result<T, EngineError> {
        self.page
            .evaluate(script)
            .await
            .map_err(protocol)?
            .into_value()
            .map_err(|e| EngineError::Protocol(e.to_string()))
    }
}

impl Page for ChromiumPage {
    async fn goto(&mut self, url: &Url) -> Result<(), EngineError> {
        self.page.goto(url.as_str()).await.map_err(protocol)?;
        Ok(())
    }

    async fn has_selector(&mut self, selector: &str) -> Result<bool, EngineError> {
        self.evaluate(format!(
            "document.querySelector({}) !== null",
            js_string(selector)
        ))
        .await
    }

    async fn stylesheet_links(&mut self) -> Result<Vec<String>, EngineError> {
        self.evaluate(
            r#"Array.from(document.querySelectorAll('link[rel="stylesheet"]'), link => link.href)"#
                .to_owned(),
        )
        .await
    }

    async fn replace_stylesheet(&mut self, href: &str, css: &str) -> Result<usize, EngineError> {
        let script = format!(
            r#"(() => {{
  const href = {href};
  const css = {css};
  let replaced = 0;
  for (const link of document.querySelectorAll('link[rel="stylesheet"]')) {{
    if (link.href !== href) continue;
    const style = document.createElement('style');
    style.textContent = css;
    link.replaceWith(style);
    replaced += 1;
  }}
  return replaced;
}})()"#,
            href = js_string(href),
            css = js_string(css),
        );
        self.evaluate(script).await
    }

    async fn response_body(&mut self, request_id: &str) -> Result<String, EngineError> {
        let reply = self
            .page
            .execute(GetResponseBodyParams::new(network::RequestId::new(
                request_id.to_owned(),
            )))
            .await
            .map_err(protocol)?;
        let body = &reply.result;
        if !body.base64_encoded {
            return Ok(body.body.clone());
        }
        let bytes = STANDARD
            .decode(body.body.as_bytes())
            .map_err(|e| EngineError::Protocol(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| EngineError::Protocol(e.to_string()))
    }

    async fn content(&mut self) -> Result<String, EngineError> {
        self.page.content().await.map_err(protocol)
    }

    async fn close(self) -> Result<(), EngineError> {
        for task in &self.tasks {
            task.abort();
        }
        self.page.close().await.map_err(protocol)
    }
}

async fn fulfill(
    page: &CdpPage,
    id: fetch::RequestId,
    synthetic: &SyntheticResponse,
) -> Result<(), EngineError> {
    let params = FulfillRequestParams::builder()
        .request_id(id)
        .response_code(i64::from(synthetic.status))
        .response_headers(vec![HeaderEntry::new(
            "Content-Type",
            synthetic.content_type.clone(),
        )])
        .body(STANDARD.encode(&synthetic.body))
        .build()
        .map_err(EngineError::Protocol)?;
    page.execute(params).await.map_err(protocol)?;
    Ok(())
}

fn resource_kind(kind: &network::ResourceType) -> ResourceKind {
    use network::ResourceType as T;
    match kind {
        T::Document => ResourceKind::Document,
        T::Stylesheet => ResourceKind::Stylesheet,
        T::Image => ResourceKind::Image,
        T::Media => ResourceKind::Media,
        T::Font => ResourceKind::Font,
        T::Script => ResourceKind::Script,
        T::TextTrack => ResourceKind::TextTrack,
        T::Xhr => ResourceKind::Xhr,
        T::Fetch => ResourceKind::Fetch,
        T::EventSource => ResourceKind::EventSource,
        T::WebSocket => ResourceKind::WebSocket,
        T::Manifest => ResourceKind::Manifest,
        _ => ResourceKind::Other,
    }
}

/// Quotes `value` as a JavaScript string literal.
fn js_string(value: &str) -> String {
    // JSON strings are valid JS string literals.
    serde_json::Value::from(value).to_string()
}

fn protocol(err: CdpError) -> EngineError {
    EngineError::Protocol(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_devtools_resource_types() {
        use network::ResourceType as T;
        assert_eq!(resource_kind(&T::Document), ResourceKind::Document);
        assert_eq!(resource_kind(&T::Xhr), ResourceKind::Xhr);
        assert_eq!(resource_kind(&T::Fetch), ResourceKind::Fetch);
        assert_eq!(resource_kind(&T::Image), ResourceKind::Image);
        assert_eq!(resource_kind(&T::Ping), ResourceKind::Other);
    }

    #[test]
    fn js_string_escapes_quotes_and_newlines() {
        assert_eq!(js_string("#posts"), r##""#posts""##);
        assert_eq!(js_string("a\"b\nc"), r#""a\"b\nc""#);
    }

    #[test]
    fn launch_options_reach_browser_config() {
        let engine = ChromiumEngine::new(LaunchOptions {
            executable: Some(PathBuf::from("/usr/bin/chromium")),
            no_sandbox: true,
            args: vec!["--disable-gpu".to_owned()],
        });
        assert!(engine.browser_config().is_ok());
    }
}
