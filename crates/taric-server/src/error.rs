use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use taric_commit::CommitError;
use taric_gate::GateError;
use taric_index::IndexError;
use taric_store::StoreError;
use taric_types::{DeltaDate, Seq};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid seq: {0:?}")]
    InvalidSeq(String),

    #[error("invalid date: {0:?}")]
    InvalidDate(String),

    #[error("invalid modtime: {0:?}")]
    InvalidModTime(String),

    #[error("no file uploaded")]
    NoFile,

    #[error("malformed upload: {0}")]
    BadUpload(String),

    #[error("upload exceeds {limit} bytes")]
    UploadTooLarge { limit: usize },

    #[error("unauthorised")]
    Unauthorised,

    #[error("delta file {0} not found")]
    FileNotFound(Seq),

    #[error("no delta files issued on {0}")]
    NoDeltas(DeltaDate),

    #[error("content rejected by {check} check")]
    Rejected { check: String },

    #[error("staging failed: {0}")]
    Staging(#[source] StoreError),

    #[error("publish failed: {0}")]
    Publish(#[source] StoreError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidSeq(_)
            | Self::InvalidDate(_)
            | Self::InvalidModTime(_)
            | Self::NoFile
            | Self::BadUpload(_)
            | Self::Rejected { .. }
            | Self::Staging(_) => StatusCode::BAD_REQUEST,
            Self::UploadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unauthorised => StatusCode::FORBIDDEN,
            Self::FileNotFound(_) | Self::NoDeltas(_) => StatusCode::NOT_FOUND,
            Self::Publish(_)
            | Self::Index(_)
            | Self::Store(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text sent to the client. Backend details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidSeq(_) => "Bad request [invalid seq]".into(),
            Self::InvalidDate(_) => "Bad request [invalid date]".into(),
            Self::InvalidModTime(_) => "Invalid file modification timestamp specified".into(),
            Self::NoFile => "No file uploaded".into(),
            Self::BadUpload(reason) => format!("Bad request [{reason}]"),
            Self::UploadTooLarge { limit } => format!("File too large [limit {limit} bytes]"),
            Self::Unauthorised => "Unauthorised".into(),
            Self::FileNotFound(_) => "Taric file does not exist".into(),
            Self::NoDeltas(_) => "Not found".into(),
            Self::Rejected { check } => format!("Failed {check} check"),
            Self::Staging(_) | Self::Publish(_) => "Error saving file".into(),
            Self::Index(_) => "Error updating index".into(),
            Self::Store(_) | Self::Config(_) | Self::Io(_) | Self::Internal(_) => {
                "Internal server error".into()
            }
        }
    }
}

impl From<GateError> for ServerError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::Rejected { check } => Self::Rejected { check },
        }
    }
}

impl From<CommitError> for ServerError {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::Upload(e) => Self::BadUpload(e.to_string()),
            CommitError::Staging(e) => Self::Staging(e),
            CommitError::Rejected(e) => e.into(),
            CommitError::Publish(e) => Self::Publish(e),
            CommitError::Superseded(seq) => {
                Self::Internal(format!("delta file {seq} changed while it was being published"))
            }
            CommitError::Index(e) => Self::Index(e),
            CommitError::NotFound(seq) => Self::FileNotFound(seq),
            CommitError::Store(e) => Self::Store(e),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request refused");
        }
        (status, format!("{} {}", status.as_u16(), self.public_message())).into_response()
    }
}

pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use taric_store::Operation;

    async fn body_of(error: ServerError) -> (StatusCode, String) {
        let response = error.into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn validation_errors_are_bad_request() {
        assert_eq!(
            body_of(ServerError::InvalidSeq("12".into())).await,
            (StatusCode::BAD_REQUEST, "400 Bad request [invalid seq]".into())
        );
        assert_eq!(
            body_of(ServerError::InvalidModTime("x".into())).await,
            (
                StatusCode::BAD_REQUEST,
                "400 Invalid file modification timestamp specified".into()
            )
        );
    }

    #[tokio::test]
    async fn unauthorised_is_forbidden() {
        assert_eq!(
            body_of(ServerError::Unauthorised).await,
            (StatusCode::FORBIDDEN, "403 Unauthorised".into())
        );
    }

    #[tokio::test]
    async fn backend_detail_is_not_exposed() {
        let err = ServerError::Publish(StoreError::backend(
            Operation::Rename,
            "taricfiles/TEMP_000001.xml",
            "secret bucket detail",
        ));
        let (status, body) = body_of(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "500 Error saving file");
    }

    #[test]
    fn commit_errors_map_by_phase() {
        let store_err = || StoreError::backend(Operation::Write, "k", "down");
        assert_eq!(
            ServerError::from(CommitError::Staging(store_err())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServerError::from(CommitError::Publish(store_err())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let rejected = ServerError::from(CommitError::Rejected(GateError::rejected("virus")));
        assert_eq!(rejected.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(rejected.public_message(), "Failed virus check");
        let seq = Seq::parse("000001").unwrap();
        assert_eq!(
            ServerError::from(CommitError::NotFound(seq)).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServerError::from(CommitError::Superseded(seq)).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let broken = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated");
        assert_eq!(
            ServerError::from(CommitError::Upload(broken)).status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
