//! Request filtering: per-render interception decisions.
//!
//! Every outbound request the loaded page issues is classified and answered
//! before it reaches the network:
//!
//! 1. A resource kind outside the allow-set is aborted.
//! 2. An allowed request whose URL matches a [`SyntheticResponse`] rule is
//!    fulfilled locally with the rule's status, content type and body.
//! 3. Everything else continues unmodified.
//!
//! [`RequestFilter::decide`] is a pure function of the request; the engine
//! backend carries out the decision.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::{Origin, Url};

/// The engine's classification of a network request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Document,
    Stylesheet,
    Image,
    Media,
    Font,
    Script,
    TextTrack,
    Xhr,
    Fetch,
    EventSource,
    WebSocket,
    Manifest,
    Other,
}

impl ResourceKind {
    /// Returns the lowercase name used in config files and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Stylesheet => "stylesheet",
            Self::Image => "image",
            Self::Media => "media",
            Self::Font => "font",
            Self::Script => "script",
            Self::TextTrack => "texttrack",
            Self::Xhr => "xhr",
            Self::Fetch => "fetch",
            Self::EventSource => "eventsource",
            Self::WebSocket => "websocket",
            Self::Manifest => "manifest",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A locally synthesized answer for requests whose URL ends with `url_suffix`.
///
/// Used to hand the page a precomputed asset (e.g. a minified bundle) without
/// a network round trip. The suffix is compared against the URL with its
/// query string and fragment removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticResponse {
    pub url_suffix: String,
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

impl SyntheticResponse {
    pub fn new(
        url_suffix: impl Into<String>,
        status: u16,
        content_type: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            url_suffix: url_suffix.into(),
            status,
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    /// Returns `true` if this rule answers requests for `url`.
    pub fn matches(&self, url: &str) -> bool {
        let bare = url.split(['?', '#']).next().unwrap_or(url);
        bare.ends_with(&self.url_suffix)
    }
}

/// Process-wide filter configuration shared by every render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRules {
    allow: HashSet<ResourceKind>,
    synthetic: Vec<SyntheticResponse>,
}

impl Default for FilterRules {
    fn default() -> Self {
        Self::new([
            ResourceKind::Document,
            ResourceKind::Script,
            ResourceKind::Xhr,
            ResourceKind::Fetch,
        ])
    }
}

impl FilterRules {
    /// Creates rules admitting exactly the given resource kinds.
    pub fn new(allow: impl IntoIterator<Item = ResourceKind>) -> Self {
        Self {
            allow: allow.into_iter().collect(),
            synthetic: Vec::new(),
        }
    }

    /// Adds a resource kind to the allow-set.
    pub fn allow(&mut self, kind: ResourceKind) -> &mut Self {
        self.allow.insert(kind);
        self
    }

    /// Registers a synthetic-response rule. Earlier rules take precedence.
    pub fn synthesize(&mut self, rule: SyntheticResponse) -> &mut Self {
        self.synthetic.push(rule);
        self
    }

    pub fn is_allowed(&self, kind: ResourceKind) -> bool {
        self.allow.contains(&kind)
    }

    pub fn synthetic_rules(&self) -> &[SyntheticResponse] {
        &self.synthetic
    }
}

/// Transient view of one paused network request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptedRequest {
    pub kind: ResourceKind,
    pub url: String,
    pub same_origin: bool,
}

/// What to do with an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision<'a> {
    /// Fail the request; the page sees a load error for the resource.
    Abort,
    /// Let the request reach the network unmodified.
    Continue,
    /// Answer locally without touching the network.
    Fulfill(&'a SyntheticResponse),
}

/// Filter bound to one render's page origin.
#[derive(Debug, Clone)]
pub struct RequestFilter {
    rules: Arc<FilterRules>,
    origin: Origin,
}

impl RequestFilter {
    pub fn new(rules: Arc<FilterRules>, page_url: &Url) -> Self {
        Self {
            rules,
            origin: page_url.origin(),
        }
    }

    /// Builds the interception record for a request to `url`.
    pub fn classify(&self, kind: ResourceKind, url: &str) -> InterceptedRequest {
        InterceptedRequest {
            kind,
            url: url.to_owned(),
            same_origin: is_same_origin(&self.origin, url),
        }
    }

    /// Decides the fate of `request`.
    pub fn decide(&self, request: &InterceptedRequest) -> Decision<'_> {
        let decision = if !self.rules.is_allowed(request.kind) {
            Decision::Abort
        } else if let Some(rule) = self
            .rules
            .synthetic_rules()
            .iter()
            .find(|rule| rule.matches(&request.url))
        {
            Decision::Fulfill(rule)
        } else {
            Decision::Continue
        };

        debug!(
            kind = %request.kind,
            url = %request.url,
            same_origin = request.same_origin,
            decision = ?DecisionTag::from(&decision),
            "request intercepted"
        );
        decision
    }
}

/// Compact decision label for log fields.
#[derive(Debug)]
enum DecisionTag {
    Abort,
    Continue,
    Fulfill,
}

impl From<&Decision<'_>> for DecisionTag {
    fn from(decision: &Decision<'_>) -> Self {
        match decision {
            Decision::Abort => Self::Abort,
            Decision::Continue => Self::Continue,
            Decision::Fulfill(_) => Self::Fulfill,
        }
    }
}

/// Returns `true` if `url` parses and shares `origin`.
pub fn is_same_origin(origin: &Origin, url: &str) -> bool {
    Url::parse(url).is_ok_and(|u| &u.origin() == origin)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_with(rules: FilterRules) -> RequestFilter {
        let page = Url::parse("http://host/index.html").unwrap();
        RequestFilter::new(Arc::new(rules), &page)
    }

    #[test]
    fn image_is_always_aborted() {
        let filter = filter_with(FilterRules::default());
        let req = filter.classify(ResourceKind::Image, "http://host/logo.png");
        assert_eq!(filter.decide(&req), Decision::Abort);
    }

    #[test]
    fn document_is_passed_through() {
        let filter = filter_with(FilterRules::default());
        let req = filter.classify(ResourceKind::Document, "http://host/index.html");
        assert_eq!(filter.decide(&req), Decision::Continue);
    }

    #[test]
    fn default_allow_set() {
        let rules = FilterRules::default();
        for kind in [
            ResourceKind::Document,
            ResourceKind::Script,
            ResourceKind::Xhr,
            ResourceKind::Fetch,
        ] {
            assert!(rules.is_allowed(kind), "{kind} should be allowed");
        }
        for kind in [
            ResourceKind::Stylesheet,
            ResourceKind::Image,
            ResourceKind::Media,
            ResourceKind::Font,
        ] {
            assert!(!rules.is_allowed(kind), "{kind} should be blocked");
        }
    }

    #[test]
    fn synthetic_rule_fulfills_matching_script() {
        let mut rules = FilterRules::default();
        rules.synthesize(SyntheticResponse::new(
            "/app.js",
            200,
            "application/javascript",
            "console.log(1)",
        ));
        let filter = filter_with(rules);

        let req = filter.classify(ResourceKind::Script, "http://host/app.js?v=3");
        match filter.decide(&req) {
            Decision::Fulfill(rule) => {
                assert_eq!(rule.status, 200);
                assert_eq!(rule.content_type, "application/javascript");
                assert_eq!(&rule.body[..], b"console.log(1)");
            }
            other => panic!("expected Fulfill, got {other:?}"),
        }

        let other = filter.classify(ResourceKind::Script, "http://host/vendor.js");
        assert_eq!(filter.decide(&other), Decision::Continue);
    }

    #[test]
    fn blocked_kind_wins_over_synthetic_rule() {
        let mut rules = FilterRules::default();
        rules.synthesize(SyntheticResponse::new("/logo.png", 200, "image/png", ""));
        let filter = filter_with(rules);
        let req = filter.classify(ResourceKind::Image, "http://host/logo.png");
        assert_eq!(filter.decide(&req), Decision::Abort);
    }

    #[test]
    fn allowing_stylesheets() {
        let mut rules = FilterRules::default();
        rules.allow(ResourceKind::Stylesheet);
        let filter = filter_with(rules);
        let req = filter.classify(ResourceKind::Stylesheet, "http://host/styles.css");
        assert_eq!(filter.decide(&req), Decision::Continue);
    }

    #[test]
    fn classify_computes_origin_match() {
        let filter = filter_with(FilterRules::default());
        assert!(filter.classify(ResourceKind::Script, "http://host/a.js").same_origin);
        assert!(!filter.classify(ResourceKind::Script, "http://cdn.host/a.js").same_origin);
        assert!(!filter.classify(ResourceKind::Script, "https://host/a.js").same_origin);
        assert!(!filter.classify(ResourceKind::Script, "not a url").same_origin);
    }

    #[test]
    fn resource_kind_deserializes_lowercase() {
        let kinds: Vec<ResourceKind> =
            serde_json::from_str(r#"["document","xhr","websocket"]"#).unwrap();
        assert_eq!(
            kinds,
            vec![ResourceKind::Document, ResourceKind::Xhr, ResourceKind::WebSocket]
        );
    }
}
