use std::borrow::Cow;
use std::fmt::{self, Display};

/// The kind of error that occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The input provided to the tool was invalid.
    InvalidInput,
    /// Error occurred while executing the tool.
    ExecutionError,
    /// No tool with the requested name exists.
    NotFound,
    /// The tool did not finish in time.
    Timeout,
    /// The connection to the tool's server failed.
    Transport,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::InvalidInput => write!(f, "Invalid input"),
            ErrorKind::ExecutionError => write!(f, "Execution error"),
            ErrorKind::NotFound => write!(f, "Tool not found"),
            ErrorKind::Timeout => write!(f, "Timed out"),
            ErrorKind::Transport => write!(f, "Transport error"),
        }
    }
}

/// Describes a tool call error.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Error {
    kind: ErrorKind,
    reason: Option<String>,
}

impl Error {
    #[inline]
    fn new(kind: ErrorKind) -> Self {
        Self { kind, reason: None }
    }

    /// Creates a new error with the `InvalidInput` kind.
    #[inline]
    pub fn invalid_input() -> Self {
        Self::new(ErrorKind::InvalidInput)
    }

    /// Creates a new error with the `ExecutionError` kind.
    #[inline]
    pub fn execution_error() -> Self {
        Self::new(ErrorKind::ExecutionError)
    }

    /// Creates a `NotFound` error naming the missing tool.
    #[inline]
    pub fn not_found(name: &str) -> Self {
        Self::new(ErrorKind::NotFound)
            .with_reason(format!("no tool named `{name}`"))
    }

    /// Creates a new error with the `Timeout` kind.
    #[inline]
    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout)
    }

    /// Creates a new error with the `Transport` kind.
    #[inline]
    pub fn transport() -> Self {
        Self::new(ErrorKind::Transport)
    }

    /// Attaches a reason to the error.
    #[inline]
    pub fn with_reason<S: Into<String>>(self, reason: S) -> Self {
        Self {
            kind: self.kind,
            reason: Some(reason.into()),
        }
    }

    /// Returns the kind of this error.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the reason for the error.
    #[inline]
    pub fn reason(&self) -> Cow<'_, str> {
        match self.reason.as_deref() {
            Some(reason) => Cow::Borrowed(reason),
            None => Cow::Owned(format!("{}", self.kind)),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{}: {reason}", self.kind),
            None => Display::fmt(&self.kind, f),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Error::timeout().to_string(), "Timed out");
        assert_eq!(
            Error::not_found("weather").to_string(),
            "Tool not found: no tool named `weather`"
        );
        assert_eq!(Error::execution_error().with_reason("boom").reason(), "boom");
        assert_eq!(Error::invalid_input().reason(), "Invalid input");
    }
}
