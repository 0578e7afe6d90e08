use std::{fmt, io, num::{ParseFloatError, ParseIntError, TryFromIntError}, str::Utf8Error};
use quick_xml::events::attributes::AttrError;

/// What went wrong, used by callers to tell per-feature drops from fatal
/// failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No mapping rule matched the feature's tags.
    UnresolvedTags,
    /// The geometry collapsed during normalization.
    DegenerateGeometry,
    /// The tag mapping table could not be loaded. Fatal at startup.
    MalformedMappingTable,
    /// Reading or writing a file failed. Aborts the artifact.
    IoFailure,
    /// The written artifact does not match its own index. Always a bug.
    InconsistentIndex,
    InvalidConfig,
    InvalidInput,
}

impl ErrorKind {
    /// Per-feature errors are counted and skipped, all others abort the run.
    pub fn is_recoverable(self) -> bool {
        matches!(self, ErrorKind::UnresolvedTags | ErrorKind::DegenerateGeometry)
    }
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
        }
    }

    pub fn degenerate(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::DegenerateGeometry, message)
    }

    pub fn mapping(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::MalformedMappingTable, message)
    }

    pub fn inconsistent(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::InconsistentIndex, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidConfig, message)
    }

    pub fn input(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidInput, message)
    }

    /// Prefixes the message with the stage or resource the error came from.
    pub fn context(self, context: impl fmt::Display) -> Self {
        Error {
            kind: self.kind,
            message: format!("{context}: {}", self.message),
        }
    }

    /// Keeps the message but reclassifies the error.
    pub fn with_kind(self, kind: ErrorKind) -> Self {
        Error {
            kind,
            message: self.message,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error {
            kind: ErrorKind::IoFailure,
            message: value.to_string()
        }
    }
}

impl From<quick_xml::Error> for Error {
    fn from(value: quick_xml::Error) -> Self {
        Error {
            kind: ErrorKind::InvalidInput,
            message: value.to_string()
        }
    }
}

impl From<ParseFloatError> for Error {
    fn from(value: ParseFloatError) -> Self {
        Error {
            kind: ErrorKind::InvalidInput,
            message: value.to_string()
        }
    }
}

impl From<ParseIntError> for Error {
    fn from(value: ParseIntError) -> Self {
        Error {
            kind: ErrorKind::InvalidInput,
            message: value.to_string()
        }
    }
}

impl From<AttrError> for Error {
    fn from(value: AttrError) -> Self {
        Error {
            kind: ErrorKind::InvalidInput,
            message: value.to_string()
        }
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Error {
            kind: ErrorKind::InvalidInput,
            message: value.to_string()
        }
    }
}

impl From<TryFromIntError> for Error {
    fn from(value: TryFromIntError) -> Self {
        Error {
            kind: ErrorKind::InvalidInput,
            message: value.to_string()
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error {
            kind: ErrorKind::InvalidConfig,
            message: value.to_string()
        }
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(value: tempfile::PersistError) -> Self {
        Error {
            kind: ErrorKind::IoFailure,
            message: value.error.to_string()
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
