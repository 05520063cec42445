//! Async TCP server using Tokio.
//!
//! Accepts connections and dispatches HTTP/1.1 requests to a [`Router`], one
//! task per connection, with keep-alive. [`Server::serve`] stops accepting as
//! soon as its shutdown future resolves; connections already open finish
//! their current request on their own.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::http::request::{Request, RequestError};
use crate::http::{Response, StatusCode};
use crate::router::Router;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Largest request we buffer before answering `413` (1 MiB). The front-end
/// only serves reads, so anything near this is abuse.
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

const INITIAL_BUF_SIZE: usize = 4096;

/// A bound listener.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(addr: SocketAddr) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves `router` until `shutdown` resolves.
    ///
    /// Accept failures are logged and skipped; they never end the loop.
    pub async fn serve(self, router: Arc<Router>, shutdown: impl Future<Output = ()>) {
        info!(address = %self.local_addr, "prerender server listening");
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                () = &mut shutdown => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(%peer, "connection accepted");
            let router = Arc::clone(&router);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, &router).await {
                    warn!(%peer, error = %e, "connection closed with error");
                }
            });
        }

        info!("server stopped accepting connections");
    }
}

/// Reads requests off one connection until the peer closes it or a response
/// carries `Connection: close`.
async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    router: &Router,
) -> Result<(), std::io::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            debug!(%peer, "connection closed by peer");
            return Ok(());
        }

        // A single read may carry several pipelined requests.
        while !buf.is_empty() {
            if buf.len() > MAX_REQUEST_SIZE {
                warn!(%peer, "request too large, sending 413");
                let response = Response::error(StatusCode::PayloadTooLarge, "").keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                return Ok(());
            }

            let (request, body_offset) = match Request::parse(&buf) {
                Ok(pair) => pair,
                Err(RequestError::Incomplete) => break,
                Err(e) => {
                    warn!(%peer, error = %e, "bad request, sending 400");
                    let response =
                        Response::error(StatusCode::BadRequest, e.to_string()).keep_alive(false);
                    stream.write_all(&response.into_bytes()).await?;
                    return Ok(());
                }
            };

            let total = body_offset
                .checked_add(request.content_length().unwrap_or(0))
                .filter(|total| *total <= MAX_REQUEST_SIZE);
            let Some(total) = total else {
                warn!(%peer, "declared body too large, sending 413");
                let response = Response::error(StatusCode::PayloadTooLarge, "").keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                return Ok(());
            };
            if buf.len() < total {
                break;
            }
            let _ = buf.split_to(total);

            let keep_alive = request.is_keep_alive();
            debug!(
                %peer,
                method = %request.method(),
                path = %request.path(),
                "dispatching request"
            );

            let response = router.route(request).await.keep_alive(keep_alive);
            stream.write_all(&response.into_bytes()).await?;
            stream.flush().await?;

            if !keep_alive {
                return Ok(());
            }
        }
    }
}
