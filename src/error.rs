use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmaError {
    #[error("Out of memory")]
    OutOfMemory,

    #[error("No space left in address space")]
    NoSpace,

    #[error("Resource busy")]
    Busy,

    #[error("Pin count saturated, try again")]
    Again,

    #[error("Wait interrupted")]
    Interrupted,

    #[error("Operation timed out")]
    TimedOut,

    #[error("GPU engine unavailable")]
    NoDevice,

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Mapping larger than the address space")]
    TooBig,

    #[error("Mapping has been closed")]
    Closed,

    #[error("Object not found")]
    NotFound,

    #[error("Lock contention, back off and retry")]
    Deadlock,

    #[error("GPU operation failed: {0}")]
    Gpu(&'static str),

    #[error("Invariant violated: {0}")]
    Invariant(&'static str),
}

impl VmaError {
    /// Errors the caller is expected to retry rather than surface.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy | Self::Again | Self::Deadlock)
    }
}

// A convenient alias
pub type VmaResult<T> = Result<T, VmaError>;
