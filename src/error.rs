use std::fmt;

use halcyon_yaml::YamlError;
use thiserror::Error;

/// The six error kinds the core distinguishes (spec §7). Each carries enough
/// context to pick an HTTP status and a propagation policy without the
/// caller re-deriving it from a bare string.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("configuration error: {0}")]
    Config(#[from] YamlError),
}

impl EngineError {
    /// Status code the connection should answer with, if headers have not
    /// already been committed. `None` means "abort the connection", which
    /// is always the fallback once headers are already on the wire.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Parse(_) => 400,
            EngineError::ResourceExhausted(_) => 503,
            EngineError::Upstream(_) => 502,
            EngineError::Io(_) => 500,
            EngineError::Timeout(_) => 504,
            EngineError::Invariant(_) => 500,
            EngineError::Config(_) => 500,
        }
    }

    /// Invariant violations are fatal to the whole worker per spec §7; the
    /// caller is expected to log and exit rather than attempt recovery.
    pub fn is_fatal_to_process(&self) -> bool {
        matches!(self, EngineError::Invariant(_))
    }
}

impl From<std::net::AddrParseError> for EngineError {
    fn from(e: std::net::AddrParseError) -> Self {
        EngineError::Config(YamlError::Generic(e.to_string()))
    }
}

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Parse(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Parse(s.to_string())
    }
}

/// Wraps any `EngineError` for top-level (`main`) display as a terse
/// colorized one-liner instead of a `Debug` backtrace dump.
pub struct CleanError(pub EngineError);

impl fmt::Debug for CleanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\r\x1b[K{}", self)
    }
}

impl fmt::Display for CleanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\x1b[31mERROR\x1b[0m: {}", self.0)
    }
}

impl std::error::Error for CleanError {}

impl<E: Into<EngineError>> From<E> for CleanError {
    fn from(e: E) -> Self {
        CleanError(e.into())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
