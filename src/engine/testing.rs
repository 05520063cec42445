//! Scripted in-process engine for exercising the render pipeline in tests.
//!
//! Pages are described up front with [`FakePageSpec`]: the markup the page's
//! scripts would produce, when the DOM marker shows up, which sub-requests the
//! page issues and when. Sub-requests go through the real [`RequestFilter`]
//! decision, so tests observe exactly what would have reached the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use url::Url;

use super::{
    Browser, Engine, EngineEndpoint, EngineError, NetworkActivity, ObservedResponse, Page,
    PageHooks,
};
use crate::filter::{Decision, ResourceKind};

#[derive(Debug, Clone)]
pub(crate) struct FakeRequest {
    pub url: String,
    pub kind: ResourceKind,
    pub start: Duration,
    pub duration: Duration,
    pub body: String,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakePageSpec {
    body: String,
    marker: Option<(String, Duration)>,
    requests: Vec<FakeRequest>,
    stylesheets: Vec<String>,
    fail_content: bool,
}

impl FakePageSpec {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// `selector` starts matching `after` the navigation completes.
    pub fn marker(mut self, selector: &str, after: Duration) -> Self {
        self.marker = Some((selector.to_owned(), after));
        self
    }

    pub fn request(mut self, url: &str, kind: ResourceKind, start_ms: u64, duration_ms: u64) -> Self {
        self.requests.push(FakeRequest {
            url: url.to_owned(),
            kind,
            start: Duration::from_millis(start_ms),
            duration: Duration::from_millis(duration_ms),
            body: String::new(),
        });
        self
    }

    /// Adds a `<link rel="stylesheet">` whose fetch returns `css`.
    pub fn stylesheet(mut self, href: &str, css: &str) -> Self {
        self.stylesheets.push(href.to_owned());
        self.requests.push(FakeRequest {
            url: href.to_owned(),
            kind: ResourceKind::Stylesheet,
            start: Duration::from_millis(10),
            duration: Duration::from_millis(20),
            body: css.to_owned(),
        });
        self
    }

    /// Adds a `<link rel="stylesheet">` the page never fetches.
    pub fn stylesheet_link(mut self, href: &str) -> Self {
        self.stylesheets.push(href.to_owned());
        self
    }

    pub fn failing_content(mut self) -> Self {
        self.fail_content = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeSite {
    pages: HashMap<String, FakePageSpec>,
}

impl FakeSite {
    pub fn page(mut self, url: &str, spec: FakePageSpec) -> Self {
        self.pages.insert(url.to_owned(), spec);
        self
    }
}

/// A request the filter let through or answered locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Served {
    Network(String),
    Synthetic {
        url: String,
        status: u16,
        content_type: String,
        body: Vec<u8>,
    },
    Aborted(String),
}

#[derive(Debug, Default)]
pub(crate) struct FakeStats {
    launches: AtomicUsize,
    connects: AtomicUsize,
    browsers_closed: AtomicUsize,
    disconnects: AtomicUsize,
    pages_opened: AtomicUsize,
    pages_closed: AtomicUsize,
    served: Mutex<Vec<Served>>,
}

impl FakeStats {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn browsers_closed(&self) -> usize {
        self.browsers_closed.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn pages_opened(&self) -> usize {
        self.pages_opened.load(Ordering::SeqCst)
    }

    pub fn pages_closed(&self) -> usize {
        self.pages_closed.load(Ordering::SeqCst)
    }

    pub fn served(&self) -> Vec<Served> {
        self.served.lock().unwrap().clone()
    }

    fn record(&self, served: Served) {
        self.served.lock().unwrap().push(served);
    }
}

#[derive(Debug)]
pub(crate) struct FakeEngine {
    site: Arc<FakeSite>,
    stats: Arc<FakeStats>,
    fail_launch: bool,
}

impl FakeEngine {
    pub fn new(site: FakeSite) -> Self {
        Self {
            site: Arc::new(site),
            stats: Arc::new(FakeStats::default()),
            fail_launch: false,
        }
    }

    pub fn failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    pub fn stats(&self) -> Arc<FakeStats> {
        Arc::clone(&self.stats)
    }

    fn browser(&self, endpoint: EngineEndpoint) -> FakeBrowser {
        FakeBrowser {
            site: Arc::clone(&self.site),
            stats: Arc::clone(&self.stats),
            endpoint,
        }
    }
}

impl Engine for FakeEngine {
    type Browser = FakeBrowser;

    async fn launch(&self) -> Result<FakeBrowser, EngineError> {
        if self.fail_launch {
            return Err(EngineError::Launch("could not find chrome executable".into()));
        }
        let n = self.stats.launches.fetch_add(1, Ordering::SeqCst);
        Ok(self.browser(EngineEndpoint::new(format!(
            "ws://127.0.0.1:9222/devtools/browser/fake-{n}"
        ))))
    }

    async fn connect(&self, endpoint: &EngineEndpoint) -> Result<FakeBrowser, EngineError> {
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.browser(endpoint.clone()))
    }
}

pub(crate) struct FakeBrowser {
    site: Arc<FakeSite>,
    stats: Arc<FakeStats>,
    endpoint: EngineEndpoint,
}

impl Browser for FakeBrowser {
    type Page = FakePage;

    fn endpoint(&self) -> EngineEndpoint {
        self.endpoint.clone()
    }

    async fn open_page(&mut self, hooks: PageHooks) -> Result<FakePage, EngineError> {
        self.stats.pages_opened.fetch_add(1, Ordering::SeqCst);
        Ok(FakePage {
            site: Arc::clone(&self.site),
            stats: Arc::clone(&self.stats),
            hooks,
            loaded: None,
            bodies: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn close(self) -> Result<(), EngineError> {
        self.stats.browsers_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(self) -> Result<(), EngineError> {
        self.stats.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

enum Head {
    Link(String),
    Style(String),
}

struct Loaded {
    spec: FakePageSpec,
    at: Instant,
    head: Vec<Head>,
}

pub(crate) struct FakePage {
    site: Arc<FakeSite>,
    stats: Arc<FakeStats>,
    hooks: PageHooks,
    loaded: Option<Loaded>,
    bodies: Arc<Mutex<HashMap<String, String>>>,
}

impl FakePage {
    fn loaded(&mut self) -> Result<&mut Loaded, EngineError> {
        self.loaded
            .as_mut()
            .ok_or_else(|| EngineError::Protocol("page has not navigated".into()))
    }

    fn issue(&self, id: String, request: FakeRequest) {
        let activity = self.hooks.activity.clone();
        let responses = self.hooks.responses.clone();
        let bodies = Arc::clone(&self.bodies);
        tokio::spawn(async move {
            tokio::time::sleep(request.start).await;
            let _ = activity.send(NetworkActivity::Started(id.clone()));
            tokio::time::sleep(request.duration).await;
            bodies.lock().unwrap().insert(id.clone(), request.body);
            let _ = responses.send(ObservedResponse {
                request_id: id.clone(),
                url: request.url,
                kind: request.kind,
            });
            let _ = activity.send(NetworkActivity::Finished(id));
        });
    }
}

impl Page for FakePage {
    async fn goto(&mut self, url: &Url) -> Result<(), EngineError> {
        let spec = self
            .site
            .pages
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| EngineError::Protocol("net::ERR_NAME_NOT_RESOLVED".into()))?;

        let _ = self.hooks.activity.send(NetworkActivity::Started("document".into()));
        let _ = self.hooks.activity.send(NetworkActivity::Finished("document".into()));

        for (n, request) in spec.requests.iter().enumerate() {
            let intercepted = self.hooks.filter.classify(request.kind, &request.url);
            let served = match self.hooks.filter.decide(&intercepted) {
                Decision::Abort => Served::Aborted(request.url.clone()),
                Decision::Fulfill(rule) => Served::Synthetic {
                    url: request.url.clone(),
                    status: rule.status,
                    content_type: rule.content_type.clone(),
                    body: rule.body.to_vec(),
                },
                Decision::Continue => Served::Network(request.url.clone()),
            };
            if matches!(served, Served::Network(_)) {
                self.issue(format!("req-{n}"), request.clone());
            }
            self.stats.record(served);
        }

        let head = spec.stylesheets.iter().cloned().map(Head::Link).collect();
        self.loaded = Some(Loaded {
            spec,
            at: Instant::now(),
            head,
        });
        Ok(())
    }

    async fn has_selector(&mut self, selector: &str) -> Result<bool, EngineError> {
        let Some(loaded) = self.loaded.as_ref() else {
            return Ok(false);
        };
        Ok(match &loaded.spec.marker {
            Some((marker, after)) if marker == selector => Instant::now() >= loaded.at + *after,
            _ => false,
        })
    }

    async fn stylesheet_links(&mut self) -> Result<Vec<String>, EngineError> {
        let loaded = self.loaded()?;
        Ok(loaded
            .head
            .iter()
            .filter_map(|h| match h {
                Head::Link(href) => Some(href.clone()),
                Head::Style(_) => None,
            })
            .collect())
    }

    async fn replace_stylesheet(&mut self, href: &str, css: &str) -> Result<usize, EngineError> {
        let loaded = self.loaded()?;
        let mut replaced = 0;
        for entry in &mut loaded.head {
            if matches!(entry, Head::Link(h) if h == href) {
                *entry = Head::Style(css.to_owned());
                replaced += 1;
            }
        }
        Ok(replaced)
    }

    async fn response_body(&mut self, request_id: &str) -> Result<String, EngineError> {
        self.bodies
            .lock()
            .unwrap()
            .get(request_id)
            .cloned()
            .ok_or_else(|| EngineError::Protocol("No resource with given identifier found".into()))
    }

    async fn content(&mut self) -> Result<String, EngineError> {
        let loaded = self.loaded()?;
        if loaded.spec.fail_content {
            return Err(EngineError::Closed);
        }
        let head: String = loaded
            .head
            .iter()
            .map(|h| match h {
                Head::Link(href) => format!(r#"<link rel="stylesheet" href="{href}">"#),
                Head::Style(css) => format!("<style>{css}</style>"),
            })
            .collect();
        Ok(format!(
            "<html><head>{head}</head><body>{}</body></html>",
            loaded.spec.body
        ))
    }

    async fn close(self) -> Result<(), EngineError> {
        self.stats.pages_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
