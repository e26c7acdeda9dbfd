/// Lightweight error enum - only 1 byte.
/// Actual error text is stored in the VM to keep `Result` small.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoamError {
    /// Runtime error - message stored in vm.error_msg
    RuntimeError,
    /// Allocation failed even after an emergency collection
    OutOfMemory,
    /// A finalizer faulted; the inner message is stored in vm.error_msg
    GcFinalizerError,
}

impl std::fmt::Display for LoamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoamError::RuntimeError => write!(f, "Runtime Error"),
            LoamError::OutOfMemory => write!(f, "Out Of Memory"),
            LoamError::GcFinalizerError => write!(f, "Error In Finalizer"),
        }
    }
}

impl std::error::Error for LoamError {}

pub type LoamResult<T> = Result<T, LoamError>;

/// Rich error type combining [`LoamError`] kind with the stored message.
///
/// Created via [`LoamVm::into_full_error`](super::LoamVm::into_full_error)
/// after catching a `LoamError`. Implements `std::error::Error`, so it
/// composes with the `?` operator in embedder code.
#[derive(Debug, Clone)]
pub struct LoamFullError {
    /// The error variant
    pub kind: LoamError,
    /// The human-readable message
    pub message: String,
}

impl std::fmt::Display for LoamFullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for LoamFullError {}

impl LoamFullError {
    #[inline]
    pub fn kind(&self) -> LoamError {
        self.kind
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}


