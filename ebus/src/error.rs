use thiserror::Error;

/// Stable result kinds surfaced to callers.
///
/// Every bus, catalog and file operation reports one of these; callers
/// decide locally whether a kind is fatal. `Empty` is a non-fatal marker
/// (nothing to do / skipped by filter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("empty")]
    Empty,
    #[error("element not found")]
    NotFound,
    #[error("duplicate entry")]
    Duplicate,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid position")]
    InvalidPosition,
    #[error("invalid number")]
    InvalidNumber,
    #[error("invalid address")]
    InvalidAddress,
    #[error("invalid list")]
    InvalidList,
    #[error("argument value out of valid range")]
    OutOfRange,
    #[error("end of input reached")]
    Eof,
    #[error("read timeout")]
    Timeout,
    #[error("no signal")]
    NoSignal,
    #[error("send error")]
    Send,
    #[error("device error")]
    Io,
    #[error("not authorized")]
    NotAuthorized,
    #[error("shutdown")]
    Shutdown,
}

impl From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::Io
    }
}
