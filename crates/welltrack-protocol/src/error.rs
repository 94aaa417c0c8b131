use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("payload has an unexpected shape: {0}")]
    UnexpectedShape(String),
    #[error("payload is not a valid number: {0}")]
    InvalidNumber(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
