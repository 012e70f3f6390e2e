use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum GriddleError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot index document '{key}': {reason}")]
    DocumentRejected { key: String, reason: String },

    #[error("Index '{0}' was deleted")]
    IndexDeleted(String),
}

pub type Result<T> = std::result::Result<T, GriddleError>;

impl From<std::io::Error> for GriddleError {
    fn from(e: std::io::Error) -> Self {
        GriddleError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for GriddleError {
    fn from(e: serde_json::Error) -> Self {
        GriddleError::Config(e.to_string())
    }
}
