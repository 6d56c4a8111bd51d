use std::fmt::{self, Display};

/// The kind of error a completion provider reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The content is moderated.
    Moderated,
    /// The model provider is rate limited.
    RateLimitExceeded,
    /// The request never reached the provider, or the connection broke
    /// while the response was streaming.
    Transport,
    /// The provider answered with something that could not be decoded.
    InvalidResponse,
    /// Any other errors.
    Other,
}

impl ErrorKind {
    /// Returns `true` if sending the same request again may succeed.
    #[inline]
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::RateLimitExceeded | ErrorKind::Transport)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Moderated => write!(f, "Moderated"),
            ErrorKind::RateLimitExceeded => write!(f, "Rate limit exceeded"),
            ErrorKind::Transport => write!(f, "Transport error"),
            ErrorKind::InvalidResponse => write!(f, "Invalid response"),
            ErrorKind::Other => write!(f, "Other error"),
        }
    }
}
