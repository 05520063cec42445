//! Session pool accessor: hands out engine sessions for renders.
//!
//! Starting a browser is the most expensive step of a render. Callers that
//! keep a [`SharedEngine`] alive and pass its endpoint to every render only
//! pay that cost once; each render still gets its own page context.

use tracing::{debug, info, warn};

use super::{Browser, Engine, EngineEndpoint, EngineError, Page, PageHooks};
use crate::render::RenderError;

/// How a session came by its browser, which decides how it is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Started for this session; closing terminates the process.
    Launched,
    /// Attached to a shared process; closing only disconnects.
    Attached,
}

/// Obtains connected browsers from an [`Engine`].
#[derive(Debug)]
pub struct EnginePool<E> {
    engine: E,
}

impl<E: Engine> EnginePool<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    /// Returns a session for one render.
    ///
    /// With an endpoint the session attaches to that engine; without one a
    /// new isolated engine is launched and owned by the session.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::EngineLaunch`] if the engine cannot be started
    /// or reached.
    pub async fn acquire(
        &self,
        endpoint: Option<&EngineEndpoint>,
    ) -> Result<EngineSession<E::Browser>, RenderError> {
        match endpoint {
            Some(endpoint) => {
                debug!(%endpoint, "attaching to running engine");
                let browser = self
                    .engine
                    .connect(endpoint)
                    .await
                    .map_err(RenderError::EngineLaunch)?;
                Ok(EngineSession::new(browser, Ownership::Attached))
            }
            None => {
                debug!("launching isolated engine");
                let browser = self
                    .engine
                    .launch()
                    .await
                    .map_err(RenderError::EngineLaunch)?;
                Ok(EngineSession::new(browser, Ownership::Launched))
            }
        }
    }

    /// Launches a long-lived engine whose endpoint can be handed to later
    /// renders.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::EngineLaunch`] if the engine cannot be started.
    pub async fn launch_shared(&self) -> Result<SharedEngine<E::Browser>, RenderError> {
        let browser = self
            .engine
            .launch()
            .await
            .map_err(RenderError::EngineLaunch)?;
        let endpoint = browser.endpoint();
        info!(%endpoint, "shared engine started");
        Ok(SharedEngine { browser, endpoint })
    }
}

/// Browser plus at most one page, exclusively owned by a single render.
pub struct EngineSession<B: Browser> {
    browser: B,
    page: Option<B::Page>,
    ownership: Ownership,
}

impl<B: Browser> EngineSession<B> {
    fn new(browser: B, ownership: Ownership) -> Self {
        Self {
            browser,
            page: None,
            ownership,
        }
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Endpoint of the engine behind this session.
    pub fn endpoint(&self) -> EngineEndpoint {
        self.browser.endpoint()
    }

    /// Opens this session's page. A page opened earlier is replaced and closed.
    ///
    /// # Errors
    ///
    /// Propagates backend failures opening the page or wiring its hooks.
    pub async fn open_page(&mut self, hooks: PageHooks) -> Result<&mut B::Page, EngineError> {
        if let Some(previous) = self.page.take() {
            if let Err(e) = previous.close().await {
                warn!(error = %e, "failed to close replaced page");
            }
        }
        let page = self.browser.open_page(hooks).await?;
        Ok(self.page.insert(page))
    }

    /// Releases the page and the browser.
    ///
    /// The browser is released even when closing the page fails; the first
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Returns the page-close error, or else the browser-release error.
    pub async fn close(self) -> Result<(), EngineError> {
        let page_closed = match self.page {
            Some(page) => page.close().await,
            None => Ok(()),
        };
        let browser_released = match self.ownership {
            Ownership::Launched => self.browser.close().await,
            Ownership::Attached => self.browser.disconnect().await,
        };
        page_closed.and(browser_released)
    }
}

/// A long-lived engine that renders attach to by endpoint.
pub struct SharedEngine<B> {
    browser: B,
    endpoint: EngineEndpoint,
}

impl<B: Browser> SharedEngine<B> {
    pub fn endpoint(&self) -> &EngineEndpoint {
        &self.endpoint
    }

    /// Terminates the shared engine process.
    ///
    /// # Errors
    ///
    /// Propagates the backend's shutdown failure.
    pub async fn close(self) -> Result<(), EngineError> {
        info!(endpoint = %self.endpoint, "shutting down shared engine");
        self.browser.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{FakeEngine, FakeSite};

    #[tokio::test]
    async fn acquire_without_endpoint_launches() {
        let engine = FakeEngine::new(FakeSite::default());
        let stats = engine.stats();
        let pool = EnginePool::new(engine);

        let session = pool.acquire(None).await.unwrap();
        assert_eq!(session.ownership(), Ownership::Launched);
        assert_eq!(stats.launches(), 1);
        assert_eq!(stats.connects(), 0);

        session.close().await.unwrap();
        assert_eq!(stats.browsers_closed(), 1);
    }

    #[tokio::test]
    async fn acquire_with_endpoint_attaches_and_only_disconnects() {
        let engine = FakeEngine::new(FakeSite::default());
        let stats = engine.stats();
        let pool = EnginePool::new(engine);
        let endpoint = EngineEndpoint::new("ws://127.0.0.1:9222/devtools/browser/abc");

        let session = pool.acquire(Some(&endpoint)).await.unwrap();
        assert_eq!(session.ownership(), Ownership::Attached);
        assert_eq!(session.endpoint(), endpoint);
        assert_eq!(stats.launches(), 0);
        assert_eq!(stats.connects(), 1);

        session.close().await.unwrap();
        assert_eq!(stats.browsers_closed(), 0);
        assert_eq!(stats.disconnects(), 1);
    }

    #[tokio::test]
    async fn launch_failure_is_engine_launch_error() {
        let engine = FakeEngine::new(FakeSite::default()).failing_launch();
        let pool = EnginePool::new(engine);
        let err = pool.acquire(None).await.err().unwrap();
        assert!(matches!(err, RenderError::EngineLaunch(EngineError::Launch(_))));
    }

    #[tokio::test]
    async fn shared_engine_exposes_reusable_endpoint() {
        let engine = FakeEngine::new(FakeSite::default());
        let stats = engine.stats();
        let pool = EnginePool::new(engine);

        let shared = pool.launch_shared().await.unwrap();
        let session = pool.acquire(Some(shared.endpoint())).await.unwrap();
        session.close().await.unwrap();
        assert_eq!(stats.launches(), 1);
        assert_eq!(stats.connects(), 1);

        shared.close().await.unwrap();
        assert_eq!(stats.browsers_closed(), 1);
    }
}
