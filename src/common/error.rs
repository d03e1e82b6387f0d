use thiserror::Error;

/// Errors surfaced by the lookup engines.
///
/// `Clone` so that a single failed resolution can be handed to every caller
/// that was coalesced onto it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("not a fully qualified domain name or key: {0}")]
    NotFqdn(String),

    #[error("no record found for {0}")]
    RecordNotFound(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("too many redirects ({limit}) while fetching {url}")]
    RedirectLimit { url: String, limit: usize },

    #[error("aborted")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the same lookup may succeed if attempted again later.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Whether the input itself is at fault (no point retrying).
    pub fn is_permanent(&self) -> bool {
        self.kind().is_permanent()
    }

    /// Get the kind/category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Argument(_) => ErrorKind::Argument,
            Error::NotFqdn(_) => ErrorKind::NotFqdn,
            Error::RecordNotFound(_) => ErrorKind::RecordNotFound,
            Error::Http(_) => ErrorKind::Http,
            Error::RedirectLimit { .. } => ErrorKind::RedirectLimit,
            Error::Aborted => ErrorKind::Aborted,
        }
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Argument,
    NotFqdn,
    RecordNotFound,
    Http,
    RedirectLimit,
    Aborted,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RecordNotFound | ErrorKind::Http | ErrorKind::Aborted
        )
    }

    pub fn is_permanent(self) -> bool {
        matches!(self, ErrorKind::Argument | ErrorKind::NotFqdn)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Argument => "ARGUMENT",
            ErrorKind::NotFqdn => "NOT_FQDN",
            ErrorKind::RecordNotFound => "RECORD_NOT_FOUND",
            ErrorKind::Http => "HTTP",
            ErrorKind::RedirectLimit => "REDIRECT_LIMIT",
            ErrorKind::Aborted => "ABORTED",
        }
    }
}

impl From<regex::Error> for Error {
    fn from(e: regex::Error) -> Self {
        Error::Argument(e.to_string())
    }
}
