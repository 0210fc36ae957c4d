//! Classification of downstream failures.

use std::fmt;

/// Messages the routing layer returns while a shard has no serving primary.
const PRIMARY_UNAVAILABLE_MARKERS: &[&str] = &[
    "operation not allowed in state not_serving",
    "operation not allowed in state shutting_down",
    "no valid tablet",
    "no healthy tablet",
    "not serving",
];

/// Whether a failure is worth buffering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The shard has no reachable write-primary right now.
    PrimaryUnavailable,
    /// Anything else.
    Other,
}

impl FailureClass {
    /// Classify an error message (case-insensitive).
    pub fn from_error_message(message: &str) -> Self {
        let message = message.to_ascii_lowercase();
        if PRIMARY_UNAVAILABLE_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
        {
            FailureClass::PrimaryUnavailable
        } else {
            FailureClass::Other
        }
    }

    /// Classify any displayable error.
    pub fn of(error: &dyn fmt::Display) -> Self {
        Self::from_error_message(&error.to_string())
    }

    /// Whether this class is `PrimaryUnavailable`.
    pub fn is_primary_unavailable(&self) -> bool {
        matches!(self, FailureClass::PrimaryUnavailable)
    }
}
