//! Error types for rasterbridge

use std::fmt;

/// Result type for rasterbridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Severity of a report raised by the native raster layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorClass {
    None,
    Debug,
    Warning,
    Failure,
    Fatal,
}

impl ErrorClass {
    /// Maps a raw status/class number onto a class, if it is one we know
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ErrorClass::None),
            1 => Some(ErrorClass::Debug),
            2 => Some(ErrorClass::Warning),
            3 => Some(ErrorClass::Failure),
            4 => Some(ErrorClass::Fatal),
            _ => None,
        }
    }

    /// Returns the raw class number
    pub fn code(&self) -> i32 {
        match self {
            ErrorClass::None => 0,
            ErrorClass::Debug => 1,
            ErrorClass::Warning => 2,
            ErrorClass::Failure => 3,
            ErrorClass::Fatal => 4,
        }
    }
}

/// Error numbers used by the native raster layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AppDefined,
    OutOfMemory,
    FileIo,
    OpenFailed,
    IllegalArg,
    NotSupported,
    AssertionFailed,
    NoWriteAccess,
    UserInterrupt,
    ObjectNull,
    Other(i32),
}

impl ErrorCode {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => ErrorCode::AppDefined,
            2 => ErrorCode::OutOfMemory,
            3 => ErrorCode::FileIo,
            4 => ErrorCode::OpenFailed,
            5 => ErrorCode::IllegalArg,
            6 => ErrorCode::NotSupported,
            7 => ErrorCode::AssertionFailed,
            8 => ErrorCode::NoWriteAccess,
            9 => ErrorCode::UserInterrupt,
            10 => ErrorCode::ObjectNull,
            other => ErrorCode::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::AppDefined => 1,
            ErrorCode::OutOfMemory => 2,
            ErrorCode::FileIo => 3,
            ErrorCode::OpenFailed => 4,
            ErrorCode::IllegalArg => 5,
            ErrorCode::NotSupported => 6,
            ErrorCode::AssertionFailed => 7,
            ErrorCode::NoWriteAccess => 8,
            ErrorCode::UserInterrupt => 9,
            ErrorCode::ObjectNull => 10,
            ErrorCode::Other(code) => *code,
        }
    }
}

/// A single report captured from the native raster layer
#[derive(Debug, Clone, PartialEq)]
pub struct NativeError {
    pub class: ErrorClass,
    pub code: ErrorCode,
    pub message: String,
}

impl NativeError {
    pub fn new(class: ErrorClass, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            class,
            code,
            message: message.into(),
        }
    }

    /// Creates a Failure-class report
    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Failure, code, message)
    }

    /// Returns true if the report is severe enough to abort an operation
    pub fn is_fatal_or_failure(&self) -> bool {
        self.class >= ErrorClass::Failure
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?} {}] {}", self.class, self.code.code(), self.message)
    }
}

/// Error types that can occur in rasterbridge operations
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A band transfer reported a non-zero status
    Io(String),

    /// A band or its mask band could not be resolved
    NullChannel(String),

    /// The engine lacks the requested capability
    Unsupported(String),

    /// A CRS could not be resolved or no transformation path exists
    Crs(String),

    /// Mutually dependent options were violated
    Configuration(String),

    /// A value lies outside the range of its data type
    Range(String),

    /// A required storage driver is not registered
    DriverUnavailable(String),

    /// A source or destination has an unrecognized shape
    InvalidInput(String),

    /// A native report with no more specific kind
    Native(NativeError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(msg) => write!(f, "I/O failure: {}", msg),
            Error::NullChannel(msg) => write!(f, "Null channel: {}", msg),
            Error::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
            Error::Crs(msg) => write!(f, "CRS error: {}", msg),
            Error::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            Error::Range(msg) => write!(f, "Out of range: {}", msg),
            Error::DriverUnavailable(msg) => write!(f, "Driver unavailable: {}", msg),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::Native(report) => write!(f, "Native error: {}", report),
        }
    }
}

impl std::error::Error for Error {}

impl From<NativeError> for Error {
    fn from(report: NativeError) -> Self {
        match report.code {
            ErrorCode::NotSupported => Error::Unsupported(report.message),
            ErrorCode::ObjectNull => Error::NullChannel(report.message),
            ErrorCode::IllegalArg => Error::InvalidInput(report.message),
            _ => Error::Native(report),
        }
    }
}

impl From<gdal::errors::GdalError> for Error {
    fn from(err: gdal::errors::GdalError) -> Self {
        Error::Native(NativeError::failure(ErrorCode::AppDefined, err.to_string()))
    }
}
