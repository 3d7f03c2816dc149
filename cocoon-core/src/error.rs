//! Shared error taxonomy for every Cocoon component.
//!
//! One enum crosses every module boundary so the CLI can match on variant
//! instead of downcasting. See spec §7 for the policy each variant encodes.

/// Alias for `Result<T, cocoon_core::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by Cocoon operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An id/ref/record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate name, id collision, or delete-of-running without force.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Invalid configuration: unsupported format, malformed size, missing blob.
    #[error("invalid config: {0}")]
    Validation(String),

    /// A retryable HTTP/REST condition (connection failure, 5xx, 429).
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// A file read/write/rename failure.
    #[error("I/O error: {0}")]
    PermanentIo(#[from] std::io::Error),

    /// A subprocess (`qemu-img`, `mkfs.*`, the hypervisor) exited non-zero
    /// or before signaling readiness.
    #[error("subprocess {bin} failed: {detail}")]
    Subprocess {
        /// The binary that was invoked.
        bin: String,
        /// What went wrong (exit status, missing readiness signal, ...).
        detail: String,
    },

    /// A socket-ready wait, ACPI-off wait, or SIGTERM grace expired.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// `try_lock` could not acquire the lock. GC-internal only; never
    /// surfaced to a user-facing command.
    #[error("lock busy: {0}")]
    LockBusy(String),

    /// The operation's cancellation signal fired.
    #[error("canceled")]
    Canceled,

    /// JSON (de)serialization of a persisted document failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A persisted identifier is ambiguous (too-short prefix matched more
    /// than one record).
    #[error("ambiguous reference: {0}")]
    Ambiguous(String),
}

impl Error {
    /// Wraps a message as [`Error::TransientIo`] — used at REST/HTTP call
    /// sites where connection failures should trigger retry rather than
    /// surface as a permanent failure.
    #[must_use]
    pub fn transient(detail: impl std::fmt::Display) -> Self {
        Self::TransientIo(detail.to_string())
    }

    /// Returns `true` if this error is one the caller should retry,
    /// per spec §4.6's backoff policy.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }
}

/// Joins a list of per-item errors collected during a best-effort operation
/// (spec §7: `delete`/`start`/`stop` across lists).
#[must_use]
pub fn join_errors(errs: Vec<(String, Error)>) -> Option<Error> {
    if errs.is_empty() {
        return None;
    }
    let detail = errs
        .iter()
        .map(|(id, e)| format!("{id}: {e}"))
        .collect::<Vec<_>>()
        .join("; ");
    Some(Error::Validation(detail))
}
