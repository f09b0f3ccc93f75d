use thiserror::Error;

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Lock lost: {0}")]
    LockLost(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{}", join_errors(.0))]
    Aggregate(Vec<RestoreError>),
}

pub type Result<T> = std::result::Result<T, RestoreError>;

impl RestoreError {
    /// Optimistic-concurrency rejection that a read-modify-write loop may retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Errors that must abort before any lock interaction or state mutation.
    pub fn is_fatal_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Combines a primary error with follow-up failures, flattening nested aggregates.
    pub fn aggregate(errors: Vec<RestoreError>) -> RestoreError {
        let mut flat = Vec::with_capacity(errors.len());
        for err in errors {
            match err {
                Self::Aggregate(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            return flat.remove(0);
        }
        Self::Aggregate(flat)
    }

    /// The message without its category prefix, as shown on a host stat.
    pub fn detail(&self) -> String {
        match self {
            Self::Config(msg)
            | Self::NotFound(msg)
            | Self::Conflict(msg)
            | Self::Lock(msg)
            | Self::LockLost(msg)
            | Self::Transfer(msg)
            | Self::Backend(msg)
            | Self::Io(msg)
            | Self::Serialization(msg) => msg.clone(),
            Self::Aggregate(_) => self.to_string(),
        }
    }
}

fn join_errors(errors: &[RestoreError]) -> String {
    let parts = errors.iter().map(|e| e.to_string()).collect::<Vec<_>>();
    format!("[{}]", parts.join(", "))
}

impl From<std::io::Error> for RestoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RestoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for RestoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}
