//! Defines all token signer errors.
//!
//! Every error maps onto an [`ErrorKind`] with a stable, machine readable
//! code. Callers decide on retries and user feedback based on the kind,
//! the message is for humans.
use std::borrow::Cow;
use std::{error, fmt, io};

use openssl::error::ErrorStack;

//------------ ErrorKind -----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    NotFound,
    NotActive,
    NotAvailable,
    NotInitialized,
    AlreadyInitialized,
    PinIncorrect,
    PinPolicyViolation,
    WrongCertUsage,
    CertificateExists,
    CertImportFailed,
    UnsupportedAlgorithm,
    InvalidArgument,
    DeviceFault,
    InternalError,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::NotActive => "not_active",
            ErrorKind::NotAvailable => "not_available",
            ErrorKind::NotInitialized => "not_initialized",
            ErrorKind::AlreadyInitialized => "already_initialized",
            ErrorKind::PinIncorrect => "pin_incorrect",
            ErrorKind::PinPolicyViolation => "pin_policy_violation",
            ErrorKind::WrongCertUsage => "wrong_cert_usage",
            ErrorKind::CertificateExists => "certificate_exists",
            ErrorKind::CertImportFailed => "cert_import_failed",
            ErrorKind::UnsupportedAlgorithm => "unsupported_algorithm",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::DeviceFault => "device_fault",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.code())
    }
}

//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // Absent entities
    //-----------------------------------------------------------------
    TokenNotFound(String),
    KeyNotFound(String),
    CertNotFound(String),
    CertRequestNotFound(String),

    //-----------------------------------------------------------------
    // Token and key state
    //-----------------------------------------------------------------
    TokenNotActive(String),
    TokenNotInitialized(String),
    TokenAlreadyInitialized(String),
    TokenNotAvailable(String),
    TokenReadOnly(String),
    LoginNotAllowed(String),
    KeyNotAvailable(String),

    //-----------------------------------------------------------------
    // PIN handling
    //-----------------------------------------------------------------
    PinIncorrect,
    PinPolicyViolation,

    //-----------------------------------------------------------------
    // Certificates
    //-----------------------------------------------------------------
    WrongCertUsage(String),
    CertificateExists(String),
    CertImportFailed(String),

    //-----------------------------------------------------------------
    // Requests
    //-----------------------------------------------------------------
    UnsupportedAlgorithm(String),
    InvalidArgument(String),

    //-----------------------------------------------------------------
    // Device and system issues
    //-----------------------------------------------------------------
    DeviceFault(String),
    SignatureTimeout,
    IoError(IoError),
    OpenSslError(ErrorStack),
    JsonError(serde_json::Error),
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TokenNotFound(_)
            | Error::KeyNotFound(_)
            | Error::CertNotFound(_)
            | Error::CertRequestNotFound(_) => ErrorKind::NotFound,
            Error::TokenNotActive(_) => ErrorKind::NotActive,
            Error::TokenNotInitialized(_) => ErrorKind::NotInitialized,
            Error::TokenAlreadyInitialized(_) => ErrorKind::AlreadyInitialized,
            Error::TokenNotAvailable(_)
            | Error::TokenReadOnly(_)
            | Error::LoginNotAllowed(_)
            | Error::KeyNotAvailable(_) => ErrorKind::NotAvailable,
            Error::PinIncorrect => ErrorKind::PinIncorrect,
            Error::PinPolicyViolation => ErrorKind::PinPolicyViolation,
            Error::WrongCertUsage(_) => ErrorKind::WrongCertUsage,
            Error::CertificateExists(_) => ErrorKind::CertificateExists,
            Error::CertImportFailed(_) => ErrorKind::CertImportFailed,
            Error::UnsupportedAlgorithm(_) => ErrorKind::UnsupportedAlgorithm,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::DeviceFault(_) => ErrorKind::DeviceFault,
            Error::SignatureTimeout
            | Error::IoError(_)
            | Error::OpenSslError(_)
            | Error::JsonError(_)
            | Error::Internal(_) => ErrorKind::InternalError,
        }
    }

    pub fn io(context: impl Into<Cow<'static, str>>, err: io::Error) -> Self {
        Error::IoError(IoError::new(context, err))
    }

    pub fn internal(msg: impl fmt::Display) -> Self {
        Error::Internal(msg.to_string())
    }

    pub fn invalid(msg: impl fmt::Display) -> Self {
        Error::InvalidArgument(msg.to_string())
    }

    pub fn device_fault(msg: impl fmt::Display) -> Self {
        Error::DeviceFault(msg.to_string())
    }

    pub fn is_device_fault(&self) -> bool {
        self.kind() == ErrorKind::DeviceFault
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::TokenNotFound(id) => write!(f, "Token '{id}' not found"),
            Error::KeyNotFound(id) => write!(f, "Key '{id}' not found"),
            Error::CertNotFound(id) => write!(f, "Certificate '{id}' not found"),
            Error::CertRequestNotFound(id) => {
                write!(f, "Certificate request '{id}' not found")
            }
            Error::TokenNotActive(id) => write!(f, "Token '{id}' is not active"),
            Error::TokenNotInitialized(id) => {
                write!(f, "Token '{id}' is not initialized")
            }
            Error::TokenAlreadyInitialized(id) => {
                write!(f, "Token '{id}' is already initialized")
            }
            Error::TokenNotAvailable(id) => {
                write!(f, "Token '{id}' is not available")
            }
            Error::TokenReadOnly(id) => write!(f, "Token '{id}' is read-only"),
            Error::LoginNotAllowed(id) => {
                write!(f, "Login to token '{id}' is currently not allowed")
            }
            Error::KeyNotAvailable(id) => write!(f, "Key '{id}' is not available"),
            Error::PinIncorrect => write!(f, "PIN incorrect"),
            Error::PinPolicyViolation => {
                write!(f, "PIN does not meet the token PIN policy")
            }
            Error::WrongCertUsage(msg) => write!(f, "Wrong certificate usage: {msg}"),
            Error::CertificateExists(id) => {
                write!(f, "Certificate '{id}' already exists")
            }
            Error::CertImportFailed(msg) => {
                write!(f, "Failed to import certificate: {msg}")
            }
            Error::UnsupportedAlgorithm(msg) => {
                write!(f, "Unsupported algorithm: {msg}")
            }
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
            Error::DeviceFault(msg) => write!(f, "Token device fault: {msg}"),
            Error::SignatureTimeout => write!(f, "Signature calculation timed out"),
            Error::IoError(e) => e.fmt(f),
            Error::OpenSslError(e) => write!(f, "OpenSSL error: {e}"),
            Error::JsonError(e) => write!(f, "JSON error: {e}"),
            Error::Internal(msg) => f.write_str(msg),
        }
    }
}

impl error::Error for Error {}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::IoError(e)
    }
}

impl From<ErrorStack> for Error {
    fn from(e: ErrorStack) -> Self {
        Error::OpenSslError(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::JsonError(e)
    }
}

//------------ IoError -------------------------------------------------------

/// An io error with the context in which it happened.
#[derive(Debug)]
pub struct IoError {
    context: Cow<'static, str>,
    cause: io::Error,
}

impl IoError {
    pub fn new(context: impl Into<Cow<'static, str>>, cause: io::Error) -> Self {
        IoError {
            context: context.into(),
            cause,
        }
    }

    pub fn cause(&self) -> &io::Error {
        &self.cause
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.cause)
    }
}

impl error::Error for IoError {}

//------------ Tests ---------------------------------------------------------
