use std::{fmt, io, result};

/// Error taxonomy for the fastbit core, mirrored from the originating
/// C++ tree's error paths.
#[derive(Debug)]
pub enum Error {
    /// Named file does not exist.
    NotFound(String),
    /// stat/seek/read/write/map failed, or a short read on a size-known region.
    IOError(String),
    /// Allocator refused and eviction could not free enough.
    OutOfMemory(String),
    /// `inUse + request > maxBytes` even after eviction/wait.
    OutOfBudget(String),
    /// Another thread is reading the same name; blocking caller should retry.
    Busy(String),
    /// Non-blocking variant of [Error::Busy]: caller must not wait.
    WouldBlock(String),
    /// File magic, version byte, or internal size fields are inconsistent.
    BadFormat(String),
    /// Null/empty required argument, or a nonsensical range.
    ArgumentError(String),
    /// A length or offset exceeds the addressable range.
    Overflow(String),
    /// Catch-all for invariant violations that should never happen.
    Fatal(String),
}

pub type Result<T> = result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        match self {
            Error::NotFound(s) => write!(f, "NotFound: {}", s),
            Error::IOError(s) => write!(f, "IOError: {}", s),
            Error::OutOfMemory(s) => write!(f, "OutOfMemory: {}", s),
            Error::OutOfBudget(s) => write!(f, "OutOfBudget: {}", s),
            Error::Busy(s) => write!(f, "Busy: {}", s),
            Error::WouldBlock(s) => write!(f, "WouldBlock: {}", s),
            Error::BadFormat(s) => write!(f, "BadFormat: {}", s),
            Error::ArgumentError(s) => write!(f, "ArgumentError: {}", s),
            Error::Overflow(s) => write!(f, "Overflow: {}", s),
            Error::Fatal(s) => write!(f, "Fatal: {}", s),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IOError(err.to_string())
    }
}

/// Construct an [Error] with a formatted message, and thread it through
/// `?` the same way the originating tree's `err_at!` does.
///
/// ```ignore
/// err_at!(IOError, msg: "short read {}/{}", got, want)?;
/// err_at!(IOError, fd.read(&mut buf))?;
/// ```
#[macro_export]
macro_rules! err_at {
    ($variant:ident, msg: $($arg:expr),+) => {{
        Err($crate::Error::$variant(format!($($arg),+)))
    }};
    ($variant:ident, $expr:expr) => {{
        match $expr {
            Ok(val) => Ok(val),
            Err(err) => Err($crate::Error::$variant(format!("{}", err))),
        }
    }};
    ($variant:ident, $expr:expr, $($arg:expr),+) => {{
        match $expr {
            Ok(val) => Ok(val),
            Err(err) => Err($crate::Error::$variant(format!(
                "{}: {}", format!($($arg),+), err
            ))),
        }
    }};
}
