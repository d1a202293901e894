//! Error type for fallible engine operations and the `verify!` contract check.

use ash::vk;

/// Errors surfaced by object creation and submission.
///
/// Per-frame operations never return this; they report failure through `bool`/`Option`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RhiError {
    /// A native call returned an error code.
    Native { op: &'static str, result: vk::Result },
    /// An identity that is not (or no longer) registered with the device.
    ObjectNotFound(String),
    /// No memory type or heap space satisfies the request.
    OutOfMemory(String),
    /// Arguments that can never be valid.
    InvalidArgument(String),
    /// Feature not available on this device or backend.
    Unsupported(String),
    /// Backend initialisation or loader failure.
    Backend(String),
}

impl RhiError {
    pub(crate) fn native(op: &'static str) -> impl FnOnce(vk::Result) -> RhiError {
        move |result| {
            log::error!("{} failed: {:?}", op, result);
            RhiError::Native { op, result }
        }
    }
}

impl std::fmt::Display for RhiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RhiError::Native { op, result } => write!(f, "{} failed: {:?}", op, result),
            RhiError::ObjectNotFound(what) => write!(f, "{} is not registered with the device", what),
            RhiError::OutOfMemory(what) => write!(f, "Out of memory: {}", what),
            RhiError::InvalidArgument(what) => write!(f, "Invalid argument: {}", what),
            RhiError::Unsupported(what) => write!(f, "Unsupported: {}", what),
            RhiError::Backend(what) => write!(f, "Backend error: {}", what),
        }
    }
}

impl std::error::Error for RhiError {}

impl From<vk::Result> for RhiError {
    fn from(result: vk::Result) -> Self {
        RhiError::Native { op: "native call", result }
    }
}

/// Whether `verify!` checks are compiled in.
pub const CHECKS_ENABLED: bool = cfg!(any(debug_assertions, feature = "development"));

/// Programmer-contract check: logs and panics in debug and `development` builds, does nothing otherwise.
///
/// The condition is not evaluated when checks are disabled.
macro_rules! verify {
    ($cond:expr, $($arg:tt)+) => {
        if $crate::error::CHECKS_ENABLED && !($cond) {
            log::error!($($arg)+);
            panic!($($arg)+);
        }
    };
}

pub(crate) use verify;
