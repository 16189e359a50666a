use thiserror::Error;

use crate::session::TransactionState;

#[derive(Error, Debug)]
pub enum DocstoreError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Compile error: {message}")]
    Compile { message: String },
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("State error: cannot {operation} a session in state '{state}'")]
    State { state: TransactionState, operation: &'static str },
    #[error("Invalid event identifier: {0}")]
    Event(String),
    #[error("Graph error: {0}")]
    Graph(String),
    #[error("JSON error: {0}")]
    Json(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, DocstoreError>;

impl DocstoreError {
    pub fn compile(message: impl Into<String>) -> Self {
        Self::Compile { message: message.into() }
    }
    pub fn is_compile(&self) -> bool {
        matches!(self, Self::Compile { .. })
    }
    pub fn is_state(&self) -> bool {
        matches!(self, Self::State { .. })
    }
}

// Helper conversions
impl From<rusqlite::Error> for DocstoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Execution(e.to_string())
    }
}
impl From<config::ConfigError> for DocstoreError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
impl From<serde_json::Error> for DocstoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}
impl<T> From<std::sync::PoisonError<T>> for DocstoreError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Lock(e.to_string())
    }
}
