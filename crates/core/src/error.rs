use thiserror::Error;

#[derive(Debug, Error)]
pub enum VigilError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("state store error: {0}")]
    Store(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("io error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, VigilError>;
