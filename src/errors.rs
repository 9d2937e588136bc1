use std::fmt;

/// Classifies what went wrong so callers can decide whether to blame the
/// input document, a lookup that missed, or our own bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The raw graph document was malformed in a way we can attribute to
    /// whoever produced it.
    BadInput(String),
    /// A node or group name was requested that does not exist in the
    /// structure being queried.
    NotFound(String),
    /// An internal invariant did not hold; this is a bug in the builder
    /// rather than in the input.
    InvariantViolation(String),
}

impl GraphError {
    pub fn bad_input(msg: impl Into<String>) -> Self {
        GraphError::BadInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        GraphError::NotFound(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        GraphError::InvariantViolation(msg.into())
    }

    pub fn message(&self) -> &str {
        match self {
            GraphError::BadInput(msg) => msg,
            GraphError::NotFound(msg) => msg,
            GraphError::InvariantViolation(msg) => msg,
        }
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GraphError::BadInput(msg) => write!(f, "bad input: {}", msg),
            GraphError::NotFound(msg) => write!(f, "not found: {}", msg),
            GraphError::InvariantViolation(msg) => {
                write!(f, "invariant violation: {}", msg)
            }
        }
    }
}

impl std::error::Error for GraphError {}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        GraphError::BadInput(err.to_string())
    }
}

impl From<std::io::Error> for GraphError {
    fn from(err: std::io::Error) -> Self {
        GraphError::BadInput(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
