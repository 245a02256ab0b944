//! HTTP status server
//!
//! hyper http1 with TokioIo; one task per connection. The accept loop ends
//! when the shutdown signal flips.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Args;
use crate::listener::ContractEventListener;
use crate::reconfig::{Broadcaster, ProcessingGate, Trigger};
use crate::routes;
use crate::state::LiveState;
use crate::training::StatusReconciler;
use crate::types::Result;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Shared application state
pub struct AppState {
    pub args: Args,
    /// Current (metadata, store) pair
    pub live: Arc<LiveState>,
    /// Chain listener, when chain following is enabled
    pub listener: Option<Arc<ContractEventListener>>,
    /// Training-status reconciler, when model training is enabled
    pub reconciler: Option<Arc<StatusReconciler>>,
    pub broadcaster: Arc<Broadcaster>,
    pub gate: Arc<ProcessingGate>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        args: Args,
        live: Arc<LiveState>,
        broadcaster: Arc<Broadcaster>,
        gate: Arc<ProcessingGate>,
    ) -> Self {
        Self {
            args,
            live,
            listener: None,
            reconciler: None,
            broadcaster,
            gate,
            started_at: Instant::now(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<ContractEventListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_reconciler(mut self, reconciler: Arc<StatusReconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }
}

/// Serve until `shutdown` flips to `true`
pub async fn run(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(
        "Tollgate status server listening on {} as node {}",
        state.args.listen, state.args.node_id
    );

    if state.args.dev_mode {
        warn!("Development mode enabled - admin routes open without API key");
    }

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match accepted {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }

    info!("Status server stopped");
    Ok(())
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        (Method::GET, "/health") | (Method::GET, "/healthz") => routes::health_check(&state),
        (Method::GET, "/ready") | (Method::GET, "/readyz") => routes::readiness_check(&state),
        (Method::GET, "/version") => routes::version_info(),
        (Method::GET, "/status") => routes::status_check(&state).await,

        (Method::POST, "/admin/processing/stop") => {
            routes::processing_trigger(&state, req.headers(), Trigger::StopProcessing)
        }
        (Method::POST, "/admin/processing/start") => {
            routes::processing_trigger(&state, req.headers(), Trigger::StartProcessing)
        }

        (Method::OPTIONS, _) => preflight_response(),

        _ => not_found_response(&path),
    };

    Ok(to_boxed(response))
}

/// Convert a Full<Bytes> body to BoxBody
fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::ACCESS_CONTROL_ALLOW_ORIGIN,
        hyper::header::HeaderValue::from_static("*"),
    );
    headers.insert(
        hyper::header::ACCESS_CONTROL_ALLOW_HEADERS,
        hyper::header::HeaderValue::from_static("*"),
    );
    headers.insert(
        hyper::header::ACCESS_CONTROL_ALLOW_METHODS,
        hyper::header::HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    response
}

fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    routes::json_response(
        StatusCode::NOT_FOUND,
        &json!({
            "error": "Not Found",
            "path": path,
        }),
    )
}
