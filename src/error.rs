//! Error types for denoise-rt

use crate::tensor::TensorDesc;
use thiserror::Error;

/// Result type alias using denoise-rt's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification
///
/// Every [`Error`] maps to exactly one kind. The kinds mirror the error codes a
/// boundary layer reports to callers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed shapes, size mismatches, bad option values
    InvalidArgument,
    /// Operation not valid in the current state
    InvalidOperation,
    /// Allocation failure or an infeasible memory budget
    OutOfMemory,
    /// No recognized compute architecture, or capability unavailable on the backend
    UnsupportedHardware,
    /// Backend-reported failure with no finer classification
    Unknown,
}

impl ErrorKind {
    /// Numeric code of this kind (0 is reserved for "no error")
    pub fn code(self) -> u32 {
        match self {
            ErrorKind::Unknown => 1,
            ErrorKind::InvalidArgument => 2,
            ErrorKind::InvalidOperation => 3,
            ErrorKind::OutOfMemory => 4,
            ErrorKind::UnsupportedHardware => 5,
        }
    }
}

/// Errors that can occur in denoise-rt operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid argument provided to an operation
    #[error("Invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// The argument name
        arg: &'static str,
        /// Reason for invalidity
        reason: String,
    },

    /// A bound tensor does not have the descriptor a node expects
    #[error("Descriptor mismatch for '{arg}': expected {expected}, got {got}")]
    DescMismatch {
        /// The binding slot name
        arg: &'static str,
        /// Descriptor the node expects
        expected: Box<TensorDesc>,
        /// Descriptor of the rejected tensor
        got: Box<TensorDesc>,
    },

    /// Operation is not valid in the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Out of memory
    #[error("Out of memory: failed to allocate {size} bytes")]
    OutOfMemory {
        /// Requested size in bytes
        size: usize,
    },

    /// The memory budget cannot fit a single receptive-field-sized tile
    #[error("Memory budget too small: {available} bytes available, {required} bytes required")]
    BudgetExceeded {
        /// Bytes left for tile memory under the budget
        available: usize,
        /// Bytes needed by the smallest valid tile
        required: usize,
    },

    /// No suitable hardware, or a capability is unavailable on the active backend
    #[error("Unsupported hardware: {0}")]
    UnsupportedHardware(String),

    /// Backend-specific error
    #[error("Backend error: {0}")]
    Backend(String),

    /// CUDA-specific error
    #[cfg(feature = "cuda")]
    #[error("CUDA error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }

    /// Create a descriptor mismatch error
    pub fn desc_mismatch(arg: &'static str, expected: &TensorDesc, got: &TensorDesc) -> Self {
        Self::DescMismatch {
            arg,
            expected: Box::new(expected.clone()),
            got: Box::new(got.clone()),
        }
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create an unsupported hardware error
    pub fn unsupported_hardware(msg: impl Into<String>) -> Self {
        Self::UnsupportedHardware(msg.into())
    }

    /// Create a backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument { .. } | Error::DescMismatch { .. } => {
                ErrorKind::InvalidArgument
            }
            Error::InvalidOperation(_) => ErrorKind::InvalidOperation,
            Error::OutOfMemory { .. } | Error::BudgetExceeded { .. } => ErrorKind::OutOfMemory,
            Error::UnsupportedHardware(_) => ErrorKind::UnsupportedHardware,
            Error::Backend(_) | Error::Internal(_) => ErrorKind::Unknown,
            #[cfg(feature = "cuda")]
            Error::Cuda(err) => cuda_error_kind(err),
        }
    }
}

#[cfg(feature = "cuda")]
fn cuda_error_kind(err: &cudarc::driver::DriverError) -> ErrorKind {
    use cudarc::driver::sys::CUresult;

    match err.0 {
        CUresult::CUDA_ERROR_OUT_OF_MEMORY => ErrorKind::OutOfMemory,
        CUresult::CUDA_ERROR_NO_DEVICE
        | CUresult::CUDA_ERROR_NOT_SUPPORTED
        | CUresult::CUDA_ERROR_NO_BINARY_FOR_GPU
        | CUresult::CUDA_ERROR_INVALID_DEVICE => ErrorKind::UnsupportedHardware,
        _ => ErrorKind::Unknown,
    }
}
