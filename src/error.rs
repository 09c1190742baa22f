//! Crate-local error type, following the same shape as `synthizer::error`: a small
//! `#[non_exhaustive]` `thiserror` enum plus a `Result` alias defaulting its error parameter.

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error("backing buffer of {size} bytes is too small to hold a queue (need at least {needed})")]
    BufferTooSmall { size: usize, needed: usize },

    #[error("backing buffer is not aligned to a {required}-byte boundary")]
    BufferMisaligned { required: usize },
}

pub type Result<T, E = CreateError> = std::result::Result<T, E>;
