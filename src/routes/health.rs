//! Health check endpoints
//!
//! - /health, /healthz - liveness, 200 whenever the process is serving
//! - /ready, /readyz - readiness, 200 only while the chain subscription is
//!   live (or disabled) and request processing is not stopped

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use super::json_response;
use crate::listener::ListenerState;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    /// "online" or "degraded"
    pub status: &'static str,
    pub version: &'static str,
    /// Seconds since the server started
    pub uptime: u64,
    pub timestamp: String,
    /// "development" or "production"
    pub mode: &'static str,
    pub node_id: String,
    /// Generation of the live metadata/store pair
    pub generation: u64,
    /// `None` when chain following is disabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listener: Option<ListenerState>,
    pub processing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn build_health_response(state: &AppState) -> HealthResponse {
    let listener = state.listener.as_ref().map(|l| l.state());
    let processing = state.gate.is_processing();

    let error = match listener {
        Some(ListenerState::Listening) | None => None,
        Some(other) => Some(format!("Chain listener is {:?}", other)),
    };
    let error = error.or_else(|| (!processing).then(|| "Processing stopped by operator".to_string()));

    HealthResponse {
        healthy: true,
        status: if error.is_none() { "online" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: if state.args.dev_mode {
            "development"
        } else {
            "production"
        },
        node_id: state.args.node_id.to_string(),
        generation: state.live.current().number,
        listener,
        processing,
        error,
    }
}

/// Handle liveness probe (/health, /healthz)
pub fn health_check(state: &AppState) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &build_health_response(state))
}

/// Handle readiness probe (/ready, /readyz)
pub fn readiness_check(state: &AppState) -> Response<Full<Bytes>> {
    let response = build_health_response(state);
    let status = if response.error.is_none() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(status, &response)
}

/// Build information for deployment verification
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
    pub commit: &'static str,
    pub commit_full: &'static str,
    pub build_time: &'static str,
    pub service: &'static str,
}

/// Handle version endpoint (/version)
pub fn version_info() -> Response<Full<Bytes>> {
    let response = VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("TOLLGATE_GIT_SHORT").unwrap_or("unknown"),
        commit_full: option_env!("TOLLGATE_GIT_FULL").unwrap_or("unknown"),
        build_time: option_env!("TOLLGATE_BUILD_TIMESTAMP").unwrap_or("unknown"),
        service: "tollgate",
    };
    json_response(StatusCode::OK, &response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconfig::Trigger;
    use crate::server::http::tests::test_state;
    use std::time::Duration;

    #[tokio::test]
    async fn test_health_without_listener_is_online() {
        let state = test_state();
        let response = build_health_response(&state);
        assert_eq!(response.status, "online");
        assert_eq!(response.generation, 1);
        assert!(response.listener.is_none());
        assert_eq!(readiness_check(&state).status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_not_ready_while_processing_stopped() {
        let state = test_state();
        state.broadcaster.publish(Trigger::StopProcessing.code());

        for _ in 0..100 {
            if !state.gate.is_processing() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(health_check(&state).status(), StatusCode::OK);
        assert_eq!(readiness_check(&state).status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_version_names_service() {
        let response = version_info();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").and_then(|v| v.to_str().ok()),
            Some("application/json")
        );
    }
}
