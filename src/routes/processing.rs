//! Operator triggers: POST /admin/processing/{stop,start}
//!
//! Guarded by the `x-api-key` header. Without a configured key the routes are
//! only open in dev mode.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::HeaderMap;
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::{info, warn};

use super::{error_response, json_response};
use crate::reconfig::Trigger;
use crate::server::AppState;
use crate::types::TollgateError;

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub trigger: Trigger,
    pub code: i32,
    /// Subscribers the trigger was queued for
    pub delivered: usize,
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), TollgateError> {
    let provided = headers.get("x-api-key").and_then(|v| v.to_str().ok());

    match (&state.args.admin_api_key, provided) {
        (Some(expected), Some(provided)) if expected == provided => Ok(()),
        (Some(_), Some(_)) => Err(TollgateError::Unauthorized("Invalid API key".into())),
        (Some(_), None) => Err(TollgateError::Unauthorized("No API key provided".into())),
        (None, _) if state.args.dev_mode => Ok(()),
        (None, _) => Err(TollgateError::Unauthorized(
            "Admin API key not configured".into(),
        )),
    }
}

/// Publish `trigger` to every reconfiguration subscriber
pub fn processing_trigger(
    state: &AppState,
    headers: &HeaderMap,
    trigger: Trigger,
) -> Response<Full<Bytes>> {
    if let Err(err) = authorize(state, headers) {
        warn!(?trigger, "Rejected processing trigger: {}", err);
        return error_response(&err);
    }

    let delivered = state.broadcaster.publish(trigger.code());
    info!(?trigger, delivered, "Processing trigger published");

    json_response(
        StatusCode::ACCEPTED,
        &TriggerResponse {
            trigger,
            code: trigger.code(),
            delivered,
        },
    )
}
