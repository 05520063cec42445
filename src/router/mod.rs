//! Request routing: map request paths to handler functions.
//!
//! Two pattern styles are supported:
//!
//! | Pattern     | Example match        | [`Context::tail`]  |
//! |-------------|----------------------|--------------------|
//! | `/posts`    | `/posts`, `/posts/`  | *(empty)*          |
//! | `/*`        | `/css/styles.css`    | `/css/styles.css`  |
//!
//! Every route answers `GET` and `HEAD`; a `HEAD` response keeps its headers
//! and drops the body. Other methods get `405 Method Not Allowed`. Routes are
//! matched in registration order and the first match wins.

use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::http::{Request, Response, StatusCode};

/// Type-erased async handler.
pub type Handler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements it through the blanket impl.
pub trait IntoHandler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(ctx))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Exact(String),
    /// Matches the prefix itself and anything below it.
    Prefix(String),
}

impl Pattern {
    fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix("/*") {
            Some(prefix) => Pattern::Prefix(prefix.to_owned()),
            None => Pattern::Exact(trim_trailing_slash(pattern).to_owned()),
        }
    }

    /// Returns the unmatched tail on success.
    fn matches<'p>(&self, path: &'p str) -> Option<&'p str> {
        match self {
            Pattern::Exact(p) => (p == trim_trailing_slash(path)).then_some(""),
            Pattern::Prefix(prefix) => {
                let tail = path.strip_prefix(prefix.as_str())?;
                (tail.is_empty() || tail.starts_with('/')).then_some(tail)
            }
        }
    }
}

fn trim_trailing_slash(path: &str) -> &str {
    if path.len() > 1 {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    }
}

struct Route {
    pattern: Pattern,
    handler: Handler,
}

/// Dispatches read requests to the first matching route; `404` when none
/// matches.
///
/// # Examples
///
/// ```rust
/// use prerender::context::Context;
/// use prerender::router::Router;
/// use prerender::http::Response;
///
/// let mut router = Router::new();
/// router.get("/posts", |_ctx: Context| async { Response::json(&["post"]) });
/// router.get("/*", |ctx: Context| async move { Response::html(ctx.tail().to_owned()) });
/// assert_eq!(router.len(), 2);
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `GET` and `HEAD` requests matching `pattern`.
    pub fn get(&mut self, pattern: &str, handler: impl IntoHandler) {
        let handler: Handler = Arc::new(move |ctx| handler.call(ctx));
        self.routes.push(Route {
            pattern: Pattern::parse(pattern),
            handler,
        });
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub async fn route(&self, request: Request) -> Response {
        if !request.method().is_read() {
            return Response::error(StatusCode::MethodNotAllowed, "")
                .header("Allow", "GET, HEAD");
        }

        let path = request.path().to_owned();
        let Some((route, tail)) = self
            .routes
            .iter()
            .find_map(|route| route.pattern.matches(&path).map(|tail| (route, tail)))
        else {
            return Response::error(StatusCode::NotFound, "");
        };

        let ctx = Context::with_tail(request, tail);
        let head = ctx.is_head();
        let response = (route.handler)(ctx).await;
        if head { response.head_only() } else { response }
    }
}
