//! Error types for feed arbitration.

use thiserror::Error;

use crate::source::SourceId;

/// Errors reported by the registry and view-change transactions.
///
/// A request that simply cannot be received is not an error: the registry
/// reports it as `Ok(false)` after rolling back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The source name could not be translated by the provider.
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    /// No device currently exposes a feed for the source.
    #[error("Feed not found: {0}")]
    FeedNotFound(SourceId),

    /// A flag change was requested that does not change anything.
    #[error("Invalid transition for {feed}: {reason}")]
    InvalidTransition {
        feed: SourceId,
        reason: &'static str,
    },
}

/// Errors reported by a source provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Device index is outside the provider's device range.
    #[error("Device index out of range: {0}")]
    OutOfRange(usize),

    /// Device is already allocated.
    #[error("Device {0} is already allocated")]
    AlreadyAllocated(usize),

    /// Device hardware could not be opened.
    #[error("Failed to open device {index}: {reason}")]
    OpenFailed { index: usize, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = FeedError::InvalidTransition {
            feed: SourceId::new(1, 1, 3),
            reason: "primary view already off",
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition for 0001/0001/0003: primary view already off"
        );
        assert_eq!(
            ProviderError::AlreadyAllocated(2).to_string(),
            "Device 2 is already allocated"
        );
    }
}
