use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// JSON error body shared by every failure response: `{"error": "..."}`.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// An HTTP error response carrying a structured JSON body.
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new<S: Into<String>>(status: StatusCode, error: S) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: error.into(),
            },
        }
    }

    pub fn bad_request<S: Into<String>>(error: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error)
    }

    pub fn unauthorized<S: Into<String>>(error: S) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, error)
    }

    pub fn not_found<S: Into<String>>(error: S) -> Self {
        Self::new(StatusCode::NOT_FOUND, error)
    }

    pub fn internal<S: Into<String>>(error: S) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response
    }
}
