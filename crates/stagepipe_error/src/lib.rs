use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error;
use std::fmt;

pub type Result<T, E = StagepipeError> = std::result::Result<T, E>;

/// Helper macro for returning an error for still-to-be-implemented logic.
#[macro_export]
macro_rules! not_implemented {
    ($($arg:tt)+) => {{
        let msg = format!($($arg)+);
        return Err($crate::StagepipeError::new(format!("Not yet implemented: {msg}")));
    }};
}

#[derive(Debug)]
pub struct StagepipeError {
    inner: Box<StagepipeErrorInner>,
}

#[derive(Debug)]
struct StagepipeErrorInner {
    /// Message for the error.
    msg: String,

    /// Source of the error.
    source: Option<Box<dyn Error + Send + Sync>>,

    /// Captured backtrace for the error.
    ///
    /// Enable with the RUST_BACKTRACE env var.
    backtrace: Backtrace,
}

impl StagepipeError {
    pub fn new(msg: impl Into<String>) -> Self {
        StagepipeError {
            inner: Box::new(StagepipeErrorInner {
                msg: msg.into(),
                source: None,
                backtrace: Backtrace::capture(),
            }),
        }
    }

    pub fn with_source(msg: impl Into<String>, source: Box<dyn Error + Send + Sync>) -> Self {
        StagepipeError {
            inner: Box::new(StagepipeErrorInner {
                msg: msg.into(),
                source: Some(source),
                backtrace: Backtrace::capture(),
            }),
        }
    }

    pub fn get_msg(&self) -> &str {
        self.inner.msg.as_str()
    }

    pub fn get_backtrace(&self) -> &Backtrace {
        &self.inner.backtrace
    }
}

impl From<fmt::Error> for StagepipeError {
    fn from(value: fmt::Error) -> Self {
        Self::with_source("Format error", Box::new(value))
    }
}

impl From<std::io::Error> for StagepipeError {
    fn from(value: std::io::Error) -> Self {
        Self::with_source("IO error", Box::new(value))
    }
}

impl fmt::Display for StagepipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.msg)?;
        if let Some(source) = &self.inner.source {
            write!(f, "\nError source: {source}")?;
        }

        if self.inner.backtrace.status() == BacktraceStatus::Captured {
            write!(f, "\nBacktrace: {}", self.inner.backtrace)?
        }

        Ok(())
    }
}

impl Error for StagepipeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// An extension trait for adding context to the Error variant of a result.
pub trait ResultExt<T, E> {
    /// Wrap an error with a static context string.
    fn context(self, msg: &'static str) -> Result<T>;

    /// Wrap an error with a context string generated from a function.
    fn context_fn<F: Fn() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Error + Send + Sync + 'static> ResultExt<T, E> for std::result::Result<T, E> {
    fn context(self, msg: &'static str) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(StagepipeError::with_source(msg, Box::new(e))),
        }
    }

    fn context_fn<F: Fn() -> String>(self, f: F) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(StagepipeError::with_source(f(), Box::new(e))),
        }
    }
}

pub trait OptionExt<T> {
    /// Return an error if the option is None.
    fn required(self, msg: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, msg: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(StagepipeError::new(msg)),
        }
    }
}
