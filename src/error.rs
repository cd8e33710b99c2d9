//! Failure taxonomy shared across the device and server components.
//!
//! Every fallible boundary classifies its errors so callers can decide
//! between retry, surface, discard, and escalate without matching on
//! module-specific error types.

use std::fmt;

/// How a failure should be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network, storage-busy, engine-unavailable. Retried with backoff.
    Transient,

    /// Corrupt payload, invalid identity, authorization failure.
    /// Surfaced to the caller, not retried.
    Permanent,

    /// Stale stage/version on a transition. Discarded as a duplicate,
    /// logged at debug level only.
    Conflict,

    /// Audit-write failure or local storage exhaustion. Escalated:
    /// mutating actions for the affected scope pause until recovery.
    Fatal,
}

impl ErrorClass {
    /// Whether the synchronizer's backoff schedule applies.
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Conflict => "conflict",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Implemented by module error types so orchestration code can branch on
/// the class without knowing the concrete error.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

/// ENOSPC check for mapping raw IO failures to local storage exhaustion.
pub(crate) fn is_storage_full(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(28)
}
