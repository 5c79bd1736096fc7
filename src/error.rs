use std::{fmt, io};

#[derive(Clone, Copy, Debug)]
pub enum ErrorCode {
    MalformedElf = 1,
    MalformedCore = 2,
    MissingDynamicInfo = 3,
    MapsUnparseable = 4,
    ReducedCoreBroken = 5,
    Usage = 6,
    Format = 7,
    Sanity = 8,
    Internal = 9,
}

#[derive(Debug)]
pub enum ErrorEnum {
    IO(io::Error),
    Code(ErrorCode),
}

#[derive(Clone)]
pub struct Error {
    pub error: ErrorEnum,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(code: ErrorCode, message: String) -> Error {
        Error {error: ErrorEnum::Code(code), message}
    }

    pub fn is_missing_dynamic_info(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::MissingDynamicInfo) => true, _ => false, } }
    pub fn is_maps_unparseable(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::MapsUnparseable) => true, _ => false, } }
    pub fn is_usage(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::Usage) => true, _ => false, } }
    pub fn is_io_not_found(&self) -> bool { match &self.error { ErrorEnum::IO(e) if e.kind() == io::ErrorKind::NotFound => true, _ => false, } }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error {error: ErrorEnum::IO(error), message: String::new()}
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(error: std::num::ParseIntError) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error)}
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(error: std::str::Utf8Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error)}
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(error: std::string::FromUtf8Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error)}
    }
}

// For printing to log.
impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            &ErrorEnum::Code(code) => write!(f, "{}: {}", code as i64, self.message),
            ErrorEnum::IO(error) => write!(f, "{}: {}", self.message, error),
        }
    }
}

// For showing to the user.
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            &ErrorEnum::Code(_) => write!(f, "{}", self.message),
            ErrorEnum::IO(error) if self.message.is_empty() => write!(f, "{}", error),
            ErrorEnum::IO(error) => write!(f, "{}: {}", self.message, error),
        }
    }
}

impl Clone for ErrorEnum {
    fn clone(&self) -> Self {
        match self {
            Self::Code(c) => Self::Code(c.clone()),
            Self::IO(e) => Self::IO(match e.raw_os_error() {
                Some(os) => io::Error::from_raw_os_error(os),
                None => e.kind().into(),
            }),
        }
    }
}

#[macro_export]
macro_rules! error {
    ($code:ident, $($arg:tt)*) => (
        Error {error: ErrorEnum::Code(ErrorCode::$code), message: format!($($arg)*)}
    );
}

#[macro_export]
macro_rules! err {
    ($code:ident, $($arg:tt)*) => (
        Err(error!($code, $($arg)*))
    );
}

#[macro_export]
macro_rules! errno_err {
    ($($arg:tt)*) => (
        Err(Error {error: ErrorEnum::IO(::std::io::Error::last_os_error()), message: format!($($arg)*)})
    );
}
