use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("unknown target type `{0}`")]
    UnknownTargetType(String),
    #[error("domain validation failed: {message}")]
    Validation { message: String },
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}
