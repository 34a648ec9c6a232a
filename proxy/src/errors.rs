use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde::Serialize;
use shared::upstream::UpstreamError;
use std::io;

/// Errors returned to API clients. The message is the `error` field of the
/// JSON body.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    ClientInput(&'static str),

    #[error("RUZ {endpoint} {}", .status.as_u16())]
    Upstream {
        endpoint: &'static str,
        status: StatusCode,
        #[source]
        source: UpstreamError,
    },
}

impl ApiError {
    pub fn upstream(endpoint: &'static str, source: UpstreamError) -> Self {
        let status = source.client_status();
        tracing::warn!(endpoint, status = status.as_u16(), error = %source, "upstream request failed");
        ApiError::Upstream {
            endpoint,
            status,
            source,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::ClientInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream { status, .. } => *status,
        }
    }
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ApiErrorResponse {
            error: self.to_string(),
        });
        (self.status(), body).into_response()
    }
}

/// Errors that stop the proxy from starting or serving.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("could not build upstream client: {0}")]
    UpstreamClient(#[from] UpstreamError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] crate::config::ValidationError),
}
