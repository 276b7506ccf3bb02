use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// Creating the store directory.
    #[error("store directory: {0}")]
    Io(#[from] std::io::Error),

    /// Event payload or device versions that are not valid JSON.
    #[error("stored JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// No event or upload job with that id.
    #[error("{0} not found")]
    NotFound(String),

    /// An insert that would break event/upload linkage, e.g. a reused id.
    #[error("rejected write: {0}")]
    Constraint(String),

    /// Transition not allowed from the row's current status, or a status
    /// column holding an unknown value.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Store written by a newer agent, or a migration step that failed.
    #[error("schema: {0}")]
    Schema(String),
}

impl DbError {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub(crate) fn constraint(msg: impl Into<String>) -> Self {
        Self::Constraint(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
