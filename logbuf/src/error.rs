use logbuf_state::LayoutError;
use thiserror::Error;

use crate::recovery::ResetReason;

/// Failure to open a log buffer.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid arena layout: {0}")]
    Layout(LayoutError),
    #[error("backing file {0} is locked by another process")]
    Locked(String),
    #[error("the mapping is not aligned to a cache line")]
    Unaligned,
    #[error("existing arena rejected: {0}")]
    Rejected(ResetReason),
    #[error("i/o error on the backing storage")]
    Io(#[from] std::io::Error),
}

impl From<LayoutError> for OpenError {
    fn from(err: LayoutError) -> Self {
        OpenError::Layout(err)
    }
}
