use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Invalid cookie")]
    InvalidCookie,

    #[error("Malformed worker handshake: {0}")]
    Handshake(String),

    #[error("Worker registration rejected: {0}")]
    Registration(String),

    #[error(transparent)]
    ScaleSet(#[from] domain_scalesets::ScaleSetError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ManagerResult<T> = Result<T, ManagerError>;
