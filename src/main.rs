//! `prerender` binary.
//!
//! ```text
//! prerender                 serve the front-end (see prerender.toml)
//! prerender render <URL>    render one page to stdout
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use prerender::engine::chromium::ChromiumEngine;
use prerender::{App, Config, ConfigError, EngineMode, MemoryCache, Renderer, Server};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load();
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [] => serve(config).await,
        [cmd, url] if cmd == "render" => render_once(config, url).await,
        _ => {
            eprintln!("usage: prerender [render <URL>]");
            ExitCode::from(2)
        }
    }
}

fn build_renderer(config: &Config) -> Result<Renderer<ChromiumEngine>, ConfigError> {
    Ok(Renderer::new(
        ChromiumEngine::new(config.engine.launch_options()),
        Arc::new(MemoryCache::new()),
        config.render.options(),
        config.filter.rules()?,
    ))
}

async fn serve(config: Config) -> ExitCode {
    let renderer = match build_renderer(&config) {
        Ok(renderer) => renderer,
        Err(e) => {
            error!(error = %e, "invalid filter configuration");
            return ExitCode::FAILURE;
        }
    };
    let mode = EngineMode::from(&config.engine);
    let app = Arc::new(App::new(renderer, &config.server, mode));

    let server = match Server::bind(config.server.bind).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "cannot start server");
            return ExitCode::FAILURE;
        }
    };
    info!(
        url = %format!("http://{}/", server.local_addr()),
        "server started, press Ctrl+C to quit"
    );

    server.serve(Arc::new(app.router()), shutdown_signal()).await;
    app.shutdown().await;
    ExitCode::SUCCESS
}

async fn render_once(config: Config, url: &str) -> ExitCode {
    let renderer = match build_renderer(&config) {
        Ok(renderer) => renderer,
        Err(e) => {
            error!(error = %e, "invalid filter configuration");
            return ExitCode::FAILURE;
        }
    };
    let endpoint = config.engine.external_endpoint();

    match renderer.render(url, endpoint.as_ref()).await {
        Ok(result) => {
            println!("{}", result.html);
            eprintln!("Server-Timing: {}", result.server_timing());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(%url, error = %e, "render failed");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // Without a signal handler the server runs until killed.
        warn!(error = %e, "cannot listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
