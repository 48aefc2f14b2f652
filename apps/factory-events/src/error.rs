use crate::events::IngestError;
use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "event store error");
        AppError::new(StatusCode::SERVICE_UNAVAILABLE, "Event store unavailable")
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Store(err) => err.into(),
            IngestError::Conflict { ids } => {
                tracing::warn!(conflicts = ids.len(), "batch lost concurrent write races");
                AppError::new(
                    StatusCode::CONFLICT,
                    format!(
                        "Concurrent updates conflicted for {} event(s); retry the batch",
                        ids.len()
                    ),
                )
            }
        }
    }
}
