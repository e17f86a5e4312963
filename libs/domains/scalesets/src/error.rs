use azure_rest::RestError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScaleSetError {
    #[error(transparent)]
    Rest(#[from] RestError),

    #[error("Configuration error: {0}")]
    Config(#[from] core_config::ConfigError),

    #[error("No template named '{0}' in {1}")]
    UnknownTemplate(String, String),

    #[error("Malformed template: {0}")]
    Template(String),

    #[error("Quota wait interrupted")]
    Interrupted,

    #[error("Provisioning of '{0}' failed, check the Azure portal")]
    ProvisioningFailed(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ScaleSetResult<T> = Result<T, ScaleSetError>;
