use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Everything the API surfaces other than input validation and broker
/// availability becomes a 500 with the message text.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InputValidation(String),
    #[error("broker unavailable")]
    BrokerUnavailable,
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Cache(#[from] broker::CacheError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InputValidation(_) => StatusCode::BAD_REQUEST,
            ApiError::BrokerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
