use std::sync::Arc;
use std::time::{Duration, Instant};

use common::consts::{
    ANTHROPIC_PREFIX, AZURE_PREFIX, CUSTOM_PROVIDERS_PREFIX, HEALTH_PATH, OPENAI_PREFIX,
    ROUTES_PREFIX,
};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use opentelemetry::global;
use opentelemetry::trace::FutureExt;
use opentelemetry_http::HeaderExtractor;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::handlers::management::health;
use crate::handlers::response::{not_found, ProxyResponse};
use crate::handlers::{handle_admin, handle_proxy};
use crate::utils::metrics::track_request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listener {
    Proxy,
    Admin,
}

impl Listener {
    pub fn as_str(&self) -> &'static str {
        match self {
            Listener::Proxy => "proxy",
            Listener::Admin => "admin",
        }
    }
}

fn is_proxy_path(path: &str) -> bool {
    [
        OPENAI_PREFIX,
        AZURE_PREFIX,
        ANTHROPIC_PREFIX,
        ROUTES_PREFIX,
        CUSTOM_PROVIDERS_PREFIX,
    ]
    .iter()
    .any(|prefix| {
        path.strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
    })
}

// ---------------------------------------------------------------------------
// Request routing
// ---------------------------------------------------------------------------

/// Route an incoming HTTP request to the handler for its listener.
pub async fn route(
    listener: Listener,
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<ProxyResponse, hyper::Error> {
    let parent_cx = global::get_text_map_propagator(|p| p.extract(&HeaderExtractor(req.headers())));
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match listener {
        Listener::Proxy => match (&method, path.as_str()) {
            (&Method::GET, HEALTH_PATH) => health(),
            (_, p) if is_proxy_path(p) => handle_proxy(req, state).with_context(parent_cx).await?,
            _ => {
                debug!(method = %method, path = %path, "no route found");
                not_found()
            }
        },
        Listener::Admin => handle_admin(req, state).with_context(parent_cx).await?,
    };

    track_request(listener.as_str(), response.status().as_u16(), started.elapsed());
    Ok(response)
}

// ---------------------------------------------------------------------------
// Server loop
// ---------------------------------------------------------------------------

/// Accept connections until `cancel` fires, then give in-flight connections
/// up to `drain_timeout` to finish.
pub async fn serve(
    listener: TcpListener,
    kind: Listener,
    state: Arc<AppState>,
    cancel: CancellationToken,
    drain_timeout: Duration,
) {
    let graceful = GracefulShutdown::new();
    if let Ok(address) = listener.local_addr() {
        info!(listener = kind.as_str(), address = %address, "server listening");
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(listener = kind.as_str(), error = %e, "failed to accept connection");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);
                debug!(peer = ?peer_addr, "accepted connection");

                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { route(kind, req, state).await }
                });
                let connection = graceful.watch(http1::Builder::new().serve_connection(io, service));

                tokio::task::spawn(async move {
                    if let Err(err) = connection.await {
                        warn!(error = ?err, "error serving connection");
                    }
                });
            }
            _ = cancel.cancelled() => {
                info!(listener = kind.as_str(), "stopped accepting connections");
                break;
            }
        }
    }

    drop(listener);
    match tokio::time::timeout(drain_timeout, graceful.shutdown()).await {
        Ok(()) => info!(listener = kind.as_str(), "in-flight requests drained"),
        Err(_) => warn!(
            listener = kind.as_str(),
            timeout_ms = drain_timeout.as_millis() as u64,
            "gave up waiting for in-flight requests"
        ),
    }
}
