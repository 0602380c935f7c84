use std::{error, fmt, result};

/// Short form to compose Error values.
///
/// Here are few possible ways:
///
/// ```ignore
/// use crate::Error;
/// err_at!(Integrity, msg: "snapshot checksum mismatch")
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(IOError, fd.read(&mut buf));
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(IOError, fd.read(&mut buf), "reading heap record at {}", off);
/// ```
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("at {}:{}", file!(), line!());
        Err(Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("at {}:{}", file!(), line!());
                Err(Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("at {}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err(Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

/// Error variants that can be returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the
/// error location, and a message.
#[derive(Clone)]
pub enum Error {
    /// Primary key is not present in the database.
    NotFound(String, String),
    /// Primary key is already present in the database.
    AlreadyExists(String, String),
    /// Series length, field name or field type do not agree with
    /// the persisted schema.
    SchemaMismatch(String, String),
    /// Malformed series, predicate, procedure name or parameter.
    InvalidArgument(String, String),
    /// Error from the underlying file-system.
    IOError(String, String),
    /// Checksum or structural mismatch detected while loading
    /// persisted state.
    Integrity(String, String),
    /// Inproper file, or file not found.
    InvalidFile(String, String),
    /// Error converting from one type to another.
    FailConvert(String, String),
    /// Error while encoding or decoding cbor data.
    FailCbor(String, String),
    /// Invariant failure, typically a bug in this package.
    Fatal(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            NotFound(p, m) => write!(f, "NotFound {} {}", p, m),
            AlreadyExists(p, m) => write!(f, "AlreadyExists {} {}", p, m),
            SchemaMismatch(p, m) => write!(f, "SchemaMismatch {} {}", p, m),
            InvalidArgument(p, m) => write!(f, "InvalidArgument {} {}", p, m),
            IOError(p, m) => write!(f, "IOError {} {}", p, m),
            Integrity(p, m) => write!(f, "Integrity {} {}", p, m),
            InvalidFile(p, m) => write!(f, "InvalidFile {} {}", p, m),
            FailConvert(p, m) => write!(f, "FailConvert {} {}", p, m),
            FailCbor(p, m) => write!(f, "FailCbor {} {}", p, m),
            Fatal(p, m) => write!(f, "Fatal {} {}", p, m),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl error::Error for Error {}
