use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use rendezvous_shared::ProtocolError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Username already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("User is already logged in: {0}")]
    AlreadyOnline(String),

    #[error("This connection is already logged in as {0}")]
    AlreadyAuthenticated(String),

    #[error("Not logged in")]
    NotAuthenticated,

    #[error("Unknown user: {0}")]
    TargetUnknown(String),

    #[error("User is not online: {0}")]
    TargetOffline(String),

    #[error("User is not keeping up, message dropped: {0}")]
    Congested(String),

    #[error("Unknown party: {0}")]
    UnknownParty(String),

    #[error("Cannot transfer file. Both users must be online and friends.")]
    NotFriendsOrOffline,

    #[error("Registration is closed on this server")]
    RegistrationClosed,

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Account storage error: {0}")]
    Storage(String),

    #[error("Registry is shut down")]
    RegistryUnavailable,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => ServerError::Io(e),
            other => ServerError::MalformedEnvelope(other.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::TargetUnknown(_) | ServerError::NotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            ServerError::BadRequest(_) | ServerError::MalformedEnvelope(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::RegistryUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            ServerError::Io(_) | ServerError::Storage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
            _ => (StatusCode::CONFLICT, self.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
