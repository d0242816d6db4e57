//! Error types for the TinyG driver.
//!
//! [`TinygError`] consolidates every failure the driver can report, from
//! malformed report lines to device-side execution errors carried in a
//! response footer. Device errors map footer codes onto distinct variants so
//! callers can match on the kind instead of parsing message text:
//!
//! - footer code 108 -> [`TinygError::DeviceSyntax`]
//! - footer code 20  -> [`TinygError::DeviceInternal`]
//! - footer code 202 -> [`TinygError::DeviceMoveTooShort`]
//! - any other non-zero code -> [`TinygError::Device`]
//!
//! Decode errors are local: the offending line is dropped and no connection
//! state is touched. Transport errors usually mean the connection is gone.
//! `Alarm` is terminal for any in-flight file stream.
//!
//! The enum is `Clone` because errors travel on the broadcast event channel
//! to every subscriber, not just the caller that triggered them.

use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type Result<T> = std::result::Result<T, TinygError>;

/// Primary error type for the TinyG driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TinygError {
    /// A structured report line could not be parsed as relaxed JSON.
    #[error("failed to parse report line {line:?}: {reason}")]
    Decode { line: String, reason: String },

    /// Device reported a syntax error in a command it received (footer 108).
    #[error("device reported a syntax error reading '{response}' (based on {bytes_read} bytes read)")]
    DeviceSyntax { response: String, bytes_read: i64 },

    /// Device reported an internal error (footer 20).
    #[error("device reported an internal error reading '{response}' (based on {bytes_read} bytes read)")]
    DeviceInternal { response: String, bytes_read: i64 },

    /// Device rejected a move as too short to execute (footer 202).
    #[error("device reported a too-short move on line {line:?}")]
    DeviceMoveTooShort { line: Option<i64> },

    /// Device reported an execution error not covered by a specific variant.
    #[error("device reported error {code} reading '{response}' (based on {bytes_read} bytes read)")]
    Device {
        code: i64,
        response: String,
        bytes_read: i64,
    },

    /// The underlying serial channel failed.
    #[error("serial transport error: {0}")]
    Transport(String),

    /// Reading from the local input source of a file stream failed.
    #[error("stream input error: {0}")]
    Input(String),

    /// A value could not be serialized into a wire record.
    #[error("failed to serialize record: {0}")]
    Serialize(String),

    /// The machine entered alarm state; the current operation is dead.
    #[error("machine entered alarm state")]
    Alarm,

    /// `open` was called while a connection was already established.
    #[error("unable to open TinyG at '{0}': already open")]
    AlreadyOpen(String),

    /// An operation that needs an open connection was called without one.
    #[error("connection is not open")]
    NotOpen,

    /// The connection closed while an operation was outstanding.
    #[error("connection closed")]
    Closed,

    /// Autodetection found no connected device.
    #[error("autodetect found no connected TinyG")]
    NoDeviceFound,

    /// Autodetection found several devices and was told not to pick one.
    #[error("autodetect found {0} TinyGs, refusing to pick one")]
    MultipleDevices(usize),
}
