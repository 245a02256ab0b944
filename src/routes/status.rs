//! Status endpoint
//!
//! Runtime view of the live generation, the chain listener, reconciliation
//! loops and the reconfiguration broadcaster.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use super::json_response;
use crate::listener::ListenerStatus;
use crate::reconfig::OverflowPolicy;
use crate::server::AppState;
use crate::training::ScopeStatus;

#[derive(Debug, Serialize)]
pub struct OrganizationStats {
    pub org_id: String,
    pub org_name: String,
    pub group_name: String,
    pub group_id: String,
}

#[derive(Debug, Serialize)]
pub struct StorageStats {
    pub backend: &'static str,
    pub storage_type: String,
    pub endpoints: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ReconciliationStats {
    pub enabled: bool,
    pub scopes: Vec<ScopeStatus>,
}

#[derive(Debug, Serialize)]
pub struct ReconfigurationStats {
    pub processing: bool,
    pub subscribers: usize,
    pub published: u64,
    pub buffer: usize,
    pub overflow: OverflowPolicy,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub version: &'static str,
    pub uptime: u64,
    pub generation: u64,
    pub organization: OrganizationStats,
    pub storage: StorageStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listener: Option<ListenerStatus>,
    pub reconciliation: ReconciliationStats,
    pub reconfiguration: ReconfigurationStats,
}

pub async fn build_status(state: &AppState) -> StatusResponse {
    let generation = state.live.current();
    let metadata = &generation.metadata;
    let group = metadata.daemon_group();

    let listener = match &state.listener {
        Some(listener) => Some(listener.status().await),
        None => None,
    };

    StatusResponse {
        node_id: state.args.node_id.to_string(),
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        generation: generation.number,
        organization: OrganizationStats {
            org_id: metadata.org_id.clone(),
            org_name: metadata.org_name.clone(),
            group_name: group.group_name.clone(),
            group_id: group.group_id.clone(),
        },
        storage: StorageStats {
            backend: generation.store.backend(),
            storage_type: metadata.storage_type().to_string(),
            endpoints: metadata.storage_endpoints().to_vec(),
        },
        listener,
        reconciliation: ReconciliationStats {
            enabled: state.reconciler.is_some(),
            scopes: state
                .reconciler
                .as_ref()
                .map(|r| r.active_scopes())
                .unwrap_or_default(),
        },
        reconfiguration: ReconfigurationStats {
            processing: state.gate.is_processing(),
            subscribers: state.broadcaster.subscriber_count(),
            published: state.broadcaster.published_count(),
            buffer: state.broadcaster.capacity(),
            overflow: state.broadcaster.policy(),
        },
    }
}

/// Handle status endpoint (/status)
pub async fn status_check(state: &AppState) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &build_status(state).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::http::tests::test_state;

    #[tokio::test]
    async fn test_status_reports_live_pair() {
        let state = test_state();
        let status = build_status(&state).await;

        assert_eq!(status.generation, 1);
        assert_eq!(status.organization.org_id, "test_org_id");
        assert_eq!(status.organization.group_name, "default_group");
        assert_eq!(status.storage.backend, "memory");
        assert!(!status.reconciliation.enabled);
        assert!(status.listener.is_none());
        // The gate holds one subscription.
        assert_eq!(status.reconfiguration.subscribers, 1);
    }
}
