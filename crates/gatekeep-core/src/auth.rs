use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use constant_time_eq::constant_time_eq;
use serde_json::json;

use crate::AppState;

/// Gate operator routes behind `Authorization: Bearer <admin key>` when a key
/// is configured. Without `GATEKEEP_ADMIN_KEY` the routes are open.
pub async fn require_admin_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if admin_allowed(state.admin_key.as_deref(), request.headers()) {
        return next.run(request).await;
    }

    let mut resp = (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "unauthorized: a valid GATEKEEP_ADMIN_KEY bearer token is required"})),
    )
        .into_response();
    resp.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Bearer realm=\"gatekeep\""),
    );
    resp
}

fn admin_allowed(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    presented_key(headers)
        .is_some_and(|key| constant_time_eq(key.as_bytes(), expected.as_bytes()))
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}
