//! Error types for layer-sync.
//!
//! [`InvocationError`] is what a [`crate::Transport`] returns for a failed
//! request; [`SyncError`] classifies why the engine could not apply something
//! right now.  None of them is fatal: the engine degrades to "temporarily
//! stale" and a later tick or update repairs the state.

use std::{fmt, io};

use crate::types::DialogId;

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error returned by the server in response to a request.
///
/// Numeric values are stripped from the name and placed in [`RpcError::value`].
///
/// # Example
/// `FLOOD_WAIT_30` → `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30) }`
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code: i32,
    /// Error name in SCREAMING_SNAKE_CASE with digits removed.
    pub name: String,
    /// Numeric suffix extracted from the name, if any.
    pub value: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw server error message like `"FLOOD_WAIT_30"` into an `RpcError`.
    pub fn from_server(code: i32, message: &str) -> Self {
        if let Some(idx) = message.rfind('_') {
            let suffix = &message[idx + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(v) = suffix.parse::<u32>() {
                    let name = message[..idx].to_string();
                    return Self { code, name, value: Some(v) };
                }
            }
        }
        Self { code, name: message.to_string(), value: None }
    }

    /// Match on the error name, with optional wildcard prefix/suffix `'*'`.
    ///
    /// # Examples
    /// - `err.is("CHANNEL_PRIVATE")`: exact match
    /// - `err.is("PERSISTENT_*")`: starts-with match
    /// - `err.is("*_INVALID")`: ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }
}

// ─── InvocationError ──────────────────────────────────────────────────────────

/// The error type returned by every [`crate::Transport`] request.
#[derive(Debug)]
pub enum InvocationError {
    /// The server rejected the request.
    Rpc(RpcError),
    /// Network / I/O failure.
    Io(io::Error),
    /// The request was dropped (e.g. transport shut down).
    Dropped,
    /// No response within the configured fetch timeout.
    Timeout,
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e) => write!(f, "{e}"),
            Self::Io(e)  => write!(f, "I/O error: {e}"),
            Self::Dropped => write!(f, "request dropped"),
            Self::Timeout => write!(f, "request timed out"),
        }
    }
}

impl std::error::Error for InvocationError {}

impl From<io::Error> for InvocationError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl From<RpcError> for InvocationError {
    fn from(e: RpcError) -> Self { Self::Rpc(e) }
}

impl InvocationError {
    /// Returns `true` if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _            => false,
        }
    }
}

// ─── SyncError ────────────────────────────────────────────────────────────────

/// Which counter or queue an error refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Channel(i64),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global      => write!(f, "global"),
            Self::Channel(id) => write!(f, "channel {id}"),
        }
    }
}

/// Why an update or fetch result could not be applied immediately.
#[derive(Debug)]
pub enum SyncError {
    /// A predecessor is missing; the update was buffered.
    OrderingGap { scope: Scope, expected: i32, got: i32 },
    /// Already applied; dropped.
    StaleUpdate { scope: Scope, current: i32, got: i32 },
    /// The update references a peer the entity directory does not know.
    UnknownScope { dialog_id: DialogId },
    /// A catch-up request failed; the scope is re-armed for the next trigger.
    FetchFailure { scope: Scope, source: InvocationError },
    /// The server cannot send an incremental delta; a full reset is required.
    TooLong { scope: Scope },
    /// Durable storage rejected a write or read.
    Storage(io::Error),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OrderingGap { scope, expected, got } =>
                write!(f, "{scope} gap: expected {expected}, got {got}"),
            Self::StaleUpdate { scope, current, got } =>
                write!(f, "{scope} stale update: at {current}, got {got}"),
            Self::UnknownScope { dialog_id } =>
                write!(f, "unknown peer for dialog {dialog_id}"),
            Self::FetchFailure { scope, source } =>
                write!(f, "{scope} difference failed: {source}"),
            Self::TooLong { scope } =>
                write!(f, "{scope} difference too long"),
            Self::Storage(e) =>
                write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::FetchFailure { source, .. } => Some(source),
            Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SyncError {
    fn from(e: io::Error) -> Self { Self::Storage(e) }
}

impl SyncError {
    /// Every variant is recoverable; this only tells whether it is worth a `warn!`.
    pub fn is_noise(&self) -> bool {
        matches!(self, Self::StaleUpdate { .. } | Self::OrderingGap { .. })
    }
}
