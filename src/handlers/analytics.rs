use axum::{
    Json,
    body::Bytes,
    extract::{
        ConnectInfo, FromRequest, Request, State,
        rejection::{BytesRejection, FailedToBufferBody},
    },
    http::header::{CONTENT_TYPE, USER_AGENT},
};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::ApiError;
use crate::identity;
use crate::metrics::{RATE_LIMITED, REQUEST_TOTAL};
use crate::models::{EventRequest, QueuedEvent, ValidationError};
use crate::origin::check_origin;
use crate::state::AppState;

pub const MAX_BODY_BYTES: usize = 16 * 1024;
const MAX_USER_AGENT_LEN: usize = 512;

pub async fn analytics_handler(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Result<Json<Value>, ApiError> {
    REQUEST_TOTAL.inc();

    // Rate limit before anything else touches the request
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let client = state.resolver.resolve(req.headers(), peer);
    let limit = state.limits.limit_for(&client);
    if !state.limiter.check(&client.bucket(), limit).is_admitted() {
        RATE_LIMITED.inc();
        tracing::debug!(%client, limit, "rate limit exceeded");
        return Err(ApiError::RateLimited);
    }

    let headers = req.headers();
    check_origin(headers, state.site_origin.as_deref())?;

    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));
    if !is_json {
        return Err(ApiError::UnsupportedContentType);
    }

    let client_id = identity::client_id(headers);
    let session_id = identity::session_id(headers);
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .filter(|ua| ua.len() <= MAX_USER_AGENT_LEN)
        .map(str::to_string);

    // the route's DefaultBodyLimit caps this at MAX_BODY_BYTES
    let bytes = Bytes::from_request(req, &()).await.map_err(body_error)?;
    let body: Value = serde_json::from_slice(&bytes).map_err(|_| ApiError::InvalidJson)?;
    // valid JSON that is not an object has no eventName either
    let request: EventRequest =
        serde_json::from_value(body).map_err(|_| ValidationError::EventName)?;
    let event = request.validate()?;

    let queued = QueuedEvent {
        client_id,
        session_id,
        client_ip: client.ip().map(|ip| ip.to_string()),
        user_agent,
        event,
    };

    state.event_tx.send(queued).await.map_err(|_| {
        tracing::error!("event queue closed");
        ApiError::Internal
    })?;

    Ok(Json(json!({ "success": true })))
}

fn body_error(rejection: BytesRejection) -> ApiError {
    match rejection {
        BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_)) => {
            ApiError::PayloadTooLarge
        }
        other => {
            tracing::debug!(error = %other, "failed to read request body");
            ApiError::UnreadableBody
        }
    }
}
