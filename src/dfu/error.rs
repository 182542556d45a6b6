//! Error types for the Nordic Legacy DFU implementation.

use thiserror::Error;

use super::config::DfuResponseStatus;
use super::protocol::DfuPhase;

/// Result type alias for DFU operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Errors that can occur during DFU operations.
#[derive(Debug, Error)]
pub enum DfuError {
    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// ZIP archive error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON parsing error for manifest.json.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// BLE stack error from the btleplug crate.
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Required file missing from the DFU bundle.
    #[error("Missing file in DFU bundle: {filename}")]
    MissingFile { filename: String },

    /// The bundle's manifest or contents are invalid.
    #[error("Malformed DFU bundle: {reason}")]
    MalformedBundle { reason: String },

    /// The bundle declares an image combination this tool does not speak.
    #[error("Unsupported image group in DFU bundle: {group}")]
    UnsupportedBundle { group: String },

    /// Firmware bytes do not match the CRC recorded in the manifest.
    #[error("Firmware CRC mismatch: manifest says 0x{expected:04X}, computed 0x{actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// No BLE adapter present on this host.
    #[error("No BLE adapter available")]
    NoAdapter,

    /// Scan or rediscovery exhausted its timeout.
    #[error("Device not found: {detail}")]
    DeviceNotFound { detail: String },

    /// The connected device does not expose the Legacy DFU service.
    #[error("Legacy DFU service not found on device")]
    NoDfuService,

    /// Connection dropped mid-operation.
    #[error("Device disconnected during {operation}")]
    Disconnected { operation: &'static str },

    /// The bootloader answered a request with a non-success status.
    #[error("DFU request 0x{request:02X} rejected: {status}")]
    Response {
        request: u8,
        status: DfuResponseStatus,
    },

    /// A control-point notification that fits no known frame.
    #[error("Unexpected control-point notification: {0:02X?}")]
    UnexpectedNotification(Vec<u8>),

    /// Receipt notification disagrees with the host's byte count.
    #[error("Receipt reports {reported} bytes received but host sent {sent}")]
    ByteCountMismatch { reported: u32, sent: u32 },

    /// Host timed out waiting for a response or receipt.
    #[error("Timeout waiting for DFU response in {phase} phase")]
    Timeout { phase: DfuPhase },

    /// Activation was sent but the target never dropped the connection.
    #[error("Device did not disconnect within the activation window")]
    ActivationTimeout,
}
