//! Configuration constants for the Nordic Legacy DFU protocol over BLE.

use std::time::Duration;

use uuid::Uuid;

// ============================================================================
// Legacy DFU GATT UUIDs
// ============================================================================

/// Legacy DFU service.
pub const DFU_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001530_1212_efde_1523_785feabcd123);

/// DFU control point characteristic (write + notify).
pub const DFU_CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0x00001531_1212_efde_1523_785feabcd123);

/// DFU packet characteristic (write-without-response).
pub const DFU_PACKET_UUID: Uuid = Uuid::from_u128(0x00001532_1212_efde_1523_785feabcd123);

/// DFU version characteristic (read, optional on older bootloaders).
pub const DFU_VERSION_UUID: Uuid = Uuid::from_u128(0x00001534_1212_efde_1523_785feabcd123);

// ============================================================================
// Packet Configuration
// ============================================================================

/// Payload size of one GATT write to the packet characteristic.
pub const PACKET_SIZE: usize = 20;

/// Default packets-per-receipt-notification.
///
/// CoreBluetooth's write-without-response flow control rejects transfers at
/// PRN >= 10 (the bootloader reports status 0x06), so macOS gets a lower
/// default. Always overridable by the caller.
pub fn default_packets_per_notification() -> u16 {
    if cfg!(target_os = "macos") {
        8
    } else {
        10
    }
}

// ============================================================================
// Timeouts
// ============================================================================

/// Waiting for a control-point response or a packet receipt notification.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Rediscovering the bootloader after a buttonless trigger or activation.
pub const REDISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Waiting for the target to drop the connection after ACTIVATE_AND_RESET.
pub const ACTIVATION_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while waiting for the activation disconnect.
pub const ACTIVATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Length of one scan burst during rediscovery loops.
pub const SCAN_BURST: Duration = Duration::from_secs(2);

/// Pause between rediscovery scan bursts.
pub const RESCAN_DELAY: Duration = Duration::from_secs(1);

/// Grace period for the target to reboot into the bootloader.
pub const REBOOT_SETTLE_DELAY: Duration = Duration::from_millis(1500);

/// Pause after announcing the init packet before streaming its bytes.
pub const INIT_SETTLE_DELAY: Duration = Duration::from_millis(50);

// ============================================================================
// Retry Configuration
// ============================================================================

/// Maximum connect attempts against a freshly rebooted bootloader.
pub const CONNECT_ATTEMPTS: usize = 5;

/// Pause between connect attempts.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(1500);

/// Scan attempts when resolving a name/address selector.
pub const RESOLVE_ATTEMPTS: usize = 5;

/// Pause between selector-resolution scans.
pub const RESOLVE_RETRY_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// DFU Opcodes (Legacy DFU protocol)
// ============================================================================

/// Legacy DFU operation opcodes.
///
/// Single-byte opcodes written to the control point characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuOpcode {
    /// Start DFU with image type; image sizes follow on the packet characteristic
    StartDfu = 0x01,
    /// Initialize DFU parameters (receive / complete init packet)
    InitDfuParams = 0x02,
    /// Receive firmware image (data chunks follow)
    ReceiveFirmwareImage = 0x03,
    /// Validate the received firmware
    ValidateFirmware = 0x04,
    /// Activate firmware and reset device
    ActivateAndReset = 0x05,
    /// System reset without activation
    SystemReset = 0x06,
    /// Report received image size (diagnostic)
    ReportReceivedImageSize = 0x07,
    /// Request packet receipt notification interval
    PacketReceiptNotificationRequest = 0x08,
    /// Response from bootloader
    Response = 0x10,
    /// Packet receipt notification from bootloader
    PacketReceiptNotification = 0x11,
}

/// DFU image type (which firmware component a transfer contains).
///
/// Sent as a single byte in the StartDfu command; the values form a bitmask
/// (softdevice = 0x01, bootloader = 0x02, application = 0x04). Exactly one
/// bit is set per transfer: each image travels in its own session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuImageType {
    SoftDevice = 0x01,
    Bootloader = 0x02,
    Application = 0x04,
}

impl DfuImageType {
    /// The wire code sent after the StartDfu opcode.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// DFU response status codes from the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuResponseStatus {
    Success = 0x01,
    InvalidState = 0x02,
    NotSupported = 0x03,
    DataSizeExceedsLimit = 0x04,
    CrcError = 0x05,
    OperationFailed = 0x06,
}

impl DfuResponseStatus {
    /// Parse a status code from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(DfuResponseStatus::Success),
            0x02 => Some(DfuResponseStatus::InvalidState),
            0x03 => Some(DfuResponseStatus::NotSupported),
            0x04 => Some(DfuResponseStatus::DataSizeExceedsLimit),
            0x05 => Some(DfuResponseStatus::CrcError),
            0x06 => Some(DfuResponseStatus::OperationFailed),
            _ => None,
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            DfuResponseStatus::Success => "operation successful",
            DfuResponseStatus::InvalidState => "invalid state for this operation",
            DfuResponseStatus::NotSupported => "operation not supported",
            DfuResponseStatus::DataSizeExceedsLimit => "data size exceeds limit",
            DfuResponseStatus::CrcError => "CRC validation failed",
            DfuResponseStatus::OperationFailed => "operation failed",
        }
    }
}

impl std::fmt::Display for DfuResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02X} ({})", *self as u8, self.description())
    }
}

// ============================================================================
// Bootloader Detection
// ============================================================================

/// Advertised-name fragments used by known Nordic/Adafruit bootloaders.
const BOOTLOADER_NAME_MARKERS: &[&str] = &["ADADFU", "DFUTARG", "DFU"];

/// Check whether an advertised name indicates bootloader (DFU) mode.
///
/// Nordic bootloaders advertise as "DfuTarg" by default; Adafruit builds use
/// "AdaDFU"; custom bootloaders typically keep a "Dfu" suffix on the
/// application name.
pub fn is_bootloader_name(name: &str) -> bool {
    let upper = name.to_uppercase();
    BOOTLOADER_NAME_MARKERS.iter().any(|m| upper.contains(m))
}
