//! Wire framing for the Legacy DFU GATT conversation.
//!
//! Every host-to-target message is a single GATT write of at most 20 bytes:
//! an opcode byte optionally followed by parameters. The target answers on
//! the control point with RESPONSE (0x10) or PACKET_RECEIPT_NOTIFICATION
//! (0x11) frames, parsed here into [`Notification`].

use super::config::{DfuImageType, DfuOpcode, DfuResponseStatus};
use super::error::{DfuError, DfuResult};

// ============================================================================
// CRC16 (CRC-16/CCITT-FALSE, the variant Nordic uses throughout DFU)
// ============================================================================

/// Streaming CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, no reflection,
/// no final XOR.
#[derive(Debug, Clone)]
pub struct Crc16 {
    crc: u16,
}

impl Crc16 {
    pub fn new() -> Self {
        Self { crc: 0xFFFF }
    }

    /// Fold more bytes into the running CRC.
    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.crc ^= (byte as u16) << 8;
            for _ in 0..8 {
                self.crc = if self.crc & 0x8000 != 0 {
                    (self.crc << 1) ^ 0x1021
                } else {
                    self.crc << 1
                };
            }
        }
    }

    /// Current CRC over all bytes fed so far.
    pub fn value(&self) -> u16 {
        self.crc
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot CRC-16/CCITT-FALSE over a byte slice.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    crc.update(data);
    crc.value()
}

// ============================================================================
// Request Builders (control point)
// ============================================================================

/// `[0x01, image_type]` - begin a DFU for the given image type.
pub fn start_dfu_request(image_type: DfuImageType) -> [u8; 2] {
    [DfuOpcode::StartDfu as u8, image_type.code()]
}

/// `[0x02, 0x00]` to announce the init packet, `[0x02, 0x01]` to complete it.
pub fn init_params_request(complete: bool) -> [u8; 2] {
    [DfuOpcode::InitDfuParams as u8, complete as u8]
}

/// `[0x08, N_lo, N_hi]` - receipt notification every N data packets.
pub fn packet_receipt_interval_request(packets: u16) -> [u8; 3] {
    let n = packets.to_le_bytes();
    [DfuOpcode::PacketReceiptNotificationRequest as u8, n[0], n[1]]
}

/// `[0x03]` - switch the bootloader into firmware-receive mode.
pub fn receive_firmware_request() -> [u8; 1] {
    [DfuOpcode::ReceiveFirmwareImage as u8]
}

/// `[0x04]` - ask the bootloader to CRC-check the received image.
pub fn validate_request() -> [u8; 1] {
    [DfuOpcode::ValidateFirmware as u8]
}

/// `[0x05]` - activate the image and reset. The target drops the link.
pub fn activate_request() -> [u8; 1] {
    [DfuOpcode::ActivateAndReset as u8]
}

// ============================================================================
// Image Size Header (packet characteristic)
// ============================================================================

/// Build the 12-byte size header sent to the packet characteristic after
/// StartDfu: three uint32 LE values `(softdevice, bootloader, application)`.
pub fn image_size_packet(softdevice: u32, bootloader: u32, application: u32) -> [u8; 12] {
    let mut data = [0u8; 12];
    data[0..4].copy_from_slice(&softdevice.to_le_bytes());
    data[4..8].copy_from_slice(&bootloader.to_le_bytes());
    data[8..12].copy_from_slice(&application.to_le_bytes());
    data
}

// ============================================================================
// Notification Parsing (control point)
// ============================================================================

/// A parsed control-point notification from the bootloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// RESPONSE frame: `[0x10, request_opcode, status]`.
    Response {
        request: u8,
        status: DfuResponseStatus,
    },
    /// PACKET_RECEIPT_NOTIFICATION frame: `[0x11, u32 LE bytes received]`.
    PacketReceipt { bytes_received: u32 },
}

impl Notification {
    /// Parse a raw notification payload.
    pub fn parse(data: &[u8]) -> DfuResult<Self> {
        match data.first() {
            Some(&op) if op == DfuOpcode::Response as u8 => {
                if data.len() < 3 {
                    return Err(DfuError::UnexpectedNotification(data.to_vec()));
                }
                let status = DfuResponseStatus::from_byte(data[2])
                    .ok_or_else(|| DfuError::UnexpectedNotification(data.to_vec()))?;
                Ok(Notification::Response {
                    request: data[1],
                    status,
                })
            }
            Some(&op) if op == DfuOpcode::PacketReceiptNotification as u8 => {
                if data.len() < 5 {
                    return Err(DfuError::UnexpectedNotification(data.to_vec()));
                }
                let bytes_received = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
                Ok(Notification::PacketReceipt { bytes_received })
            }
            _ => Err(DfuError::UnexpectedNotification(data.to_vec())),
        }
    }
}
