//! Completion detection: deciding when a loaded page is worth snapshotting.
//!
//! A page is ready once both hold:
//!
//! 1. the network has been quiet for [`NETWORK_IDLE_WINDOW`]: no request in
//!    flight and none started or finished during the window;
//! 2. the application's DOM marker selector matches an element.
//!
//! Navigation and both waits share one timeout. Pages that lazy-load content
//! after the network settles will be snapshotted early; that is accepted.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error};
use url::Url;

use crate::engine::{EngineError, NetworkActivity, Page};
use crate::render::RenderError;

/// Quiet period that counts as network quiescence.
pub const NETWORK_IDLE_WINDOW: Duration = Duration::from_millis(500);

/// Shortest marker polling period.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Waits for a navigated page to become renderable.
#[derive(Debug, Clone)]
pub struct CompletionDetector {
    marker: String,
    timeout: Duration,
    poll_interval: Duration,
}

impl CompletionDetector {
    /// `poll_interval` is raised to [`MIN_POLL_INTERVAL`] if shorter.
    pub fn new(marker: impl Into<String>, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            marker: marker.into(),
            timeout,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Navigates `page` to `url` and waits for quiescence plus the marker.
    ///
    /// # Errors
    ///
    /// - [`RenderError::Navigation`]: the engine failed to navigate or to
    ///   query the DOM.
    /// - [`RenderError::NavigationTimeout`]: the page was not ready within the
    ///   configured timeout.
    pub async fn navigate_and_wait<P: Page>(
        &self,
        page: &mut P,
        url: &Url,
        activity: &mut UnboundedReceiver<NetworkActivity>,
    ) -> Result<(), RenderError> {
        let navigation_failed = |source: EngineError| RenderError::Navigation {
            url: url.to_string(),
            source,
        };

        let ready = async {
            page.goto(url).await.map_err(navigation_failed)?;
            debug!(%url, "navigation committed, waiting for network idle");
            wait_for_network_idle(activity, NETWORK_IDLE_WINDOW).await;
            debug!(%url, marker = %self.marker, "network idle, waiting for marker");
            self.wait_for_marker(page).await.map_err(navigation_failed)
        };

        match tokio::time::timeout(self.timeout, ready).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    %url,
                    marker = %self.marker,
                    timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    "page.goto/waitForSelector timed out"
                );
                Err(RenderError::NavigationTimeout {
                    url: url.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }

    async fn wait_for_marker<P: Page>(&self, page: &mut P) -> Result<(), EngineError> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            if page.has_selector(&self.marker).await? {
                return Ok(());
            }
        }
    }
}

/// Resolves once no request has been in flight, started, or finished for
/// `window`.
///
/// A closed channel means the page can no longer report activity; whatever was
/// in flight is written off and the window runs out.
pub async fn wait_for_network_idle(
    activity: &mut UnboundedReceiver<NetworkActivity>,
    window: Duration,
) {
    let mut in_flight: HashSet<String> = HashSet::new();
    let mut open = true;

    loop {
        if in_flight.is_empty() {
            tokio::select! {
                event = activity.recv(), if open => match event {
                    Some(event) => apply(&mut in_flight, event),
                    None => open = false,
                },
                () = tokio::time::sleep(window) => return,
            }
        } else {
            match activity.recv().await {
                Some(event) => apply(&mut in_flight, event),
                None => {
                    in_flight.clear();
                    open = false;
                }
            }
        }
    }
}

fn apply(in_flight: &mut HashSet<String>, event: NetworkActivity) {
    match event {
        NetworkActivity::Started(id) => {
            in_flight.insert(id);
        }
        NetworkActivity::Finished(id) => {
            in_flight.remove(&id);
        }
    }
}
