//! Plaintext health check served on the WebSocket port.
//!
//! Every request that is not a WebSocket upgrade is answered here.

use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};

pub const HEALTH_BODY: &str = "FDTD Backend Server Running";

/// The health response for a plain HTTP request.
pub fn respond(method: &Method) -> Response {
    if *method == Method::GET {
        ([(header::CONTENT_TYPE, "text/plain")], HEALTH_BODY).into_response()
    } else {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, "GET")],
            "Method Not Allowed",
        )
            .into_response()
    }
}
