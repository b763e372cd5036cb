//! Crate-wide error taxonomy. Startup and transport failures (version
//! timeout, bad transport, auth failure) are variants here; session-loss,
//! frame-parse, and backoff conditions are deliberately not variants.
//! Those surface as nullable fields on the public API instead, so a
//! caller never has to unwind a `Result` for something that is routine.

use core::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Tty(crate::tty::Error),
    ParseInt(std::num::ParseIntError),
    /// A line or frame didn't parse as expected. The caller that hit this
    /// should skip the offending line/frame and keep waiting, not tear
    /// down the session.
    Decode(String),
    /// No `SKVER` response at startup.
    NoVersionResponse,
    /// The dongle answered something other than the expected sentinel.
    UnexpectedResponse(String),
    /// `EVENT 24` during `SKJOIN`. The cache has already been deleted by
    /// the time this is returned.
    AuthFailed,
    /// Serial port could not be opened at all.
    Fatal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Tty(e) => write!(f, "serial transport error: {}", e),
            Error::ParseInt(e) => write!(f, "integer parse error: {}", e),
            Error::Decode(s) => write!(f, "decode error: {}", s),
            Error::NoVersionResponse => write!(f, "dongle did not answer SKVER"),
            Error::UnexpectedResponse(s) => write!(f, "unexpected response: {}", s),
            Error::AuthFailed => write!(f, "PANA authentication failed (EVENT 24)"),
            Error::Fatal(s) => write!(f, "fatal: {}", s),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Tty(e) => Some(e),
            Error::ParseInt(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<crate::tty::Error> for Error {
    fn from(error: crate::tty::Error) -> Self {
        Error::Tty(error)
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(error: std::num::ParseIntError) -> Self {
        Error::ParseInt(error)
    }
}
