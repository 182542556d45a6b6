//! Nordic Legacy DFU (Device Firmware Update) over BLE.
//!
//! This module implements the host side of Nordic's Legacy DFU protocol
//! (nRF5 SDK 15.x and earlier), enabling over-the-air firmware updates for
//! nRF5x devices.
//!
//! # Protocol Overview
//!
//! The DFU process consists of:
//! 1. **Bundle Parsing** - Extract images and init packets from the DFU ZIP
//! 2. **Device Resolution** - Find the target by handle, name, or address
//! 3. **Bootloader Entry** - Buttonless trigger if in application mode,
//!    then rediscovery of the rebooted bootloader
//! 4. **Init Transfer** - Send the init packet (`.dat`)
//! 5. **Firmware Transfer** - Stream the image in 20-byte packets under
//!    receipt-notification flow control
//! 6. **Validation** - Device CRC-checks the received image
//! 7. **Activation** - Device applies the image and reboots
//!
//! # Example
//!
//! ```ignore
//! use nrf_ota::{perform_dfu, scan_for_devices, DfuOptions};
//!
//! let devices = scan_for_devices(Duration::from_secs(5)).await?;
//! if let Some(device) = devices.into_iter().next() {
//!     perform_dfu(
//!         "firmware.zip",
//!         device,
//!         &DfuOptions::default(),
//!         |pct| println!("{pct:.0}%"),
//!         |msg| println!("{msg}"),
//!     )
//!     .await?;
//! }
//! ```

mod config;
mod device;
mod error;
mod firmware_reader;
mod packet;
mod protocol;
mod transport;

// Re-export public types and functions
// Only exports what callers of the library actually use

// Protocol driver and orchestration
pub use protocol::{perform_dfu, DfuOptions, DfuPhase, LegacyDfu, Target};

// Device discovery
pub use device::{scan_for_devices, DfuTarget};

// Errors
pub use error::{DfuError, DfuResult};

// Bundle reading
pub use firmware_reader::{read_firmware_bundle, FirmwareBundle, FirmwareImage};

// Transport seam (for callers providing their own transport)
pub use transport::{BleTransport, DfuTransport};

// Protocol constants useful to callers
pub use config::{default_packets_per_notification, DfuImageType, DfuResponseStatus};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify key types are accessible
        let _ = std::any::type_name::<DfuTarget>();
        let _ = std::any::type_name::<DfuOptions>();
        let _ = std::any::type_name::<DfuError>();
    }
}
