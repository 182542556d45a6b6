//! nrf-ota: Nordic Legacy DFU over BLE.
//!
//! A host-side implementation of Nordic's Legacy DFU protocol: connect to an
//! nRF5x target over Bluetooth Low Energy, upload a firmware bundle produced
//! by `nrfutil pkg generate`, verify it, and activate it.
//!
//! The crate exposes two entry points: [`scan_for_devices`] to enumerate
//! nearby named devices, and [`perform_dfu`] to run a complete update
//! against one of them (or against a name/address selector string).
//!
//! All I/O is cooperative; run it on a current-thread tokio runtime. A DFU
//! session is one sequential conversation with one device, so there is
//! nothing to parallelize.

pub mod dfu;

pub use dfu::{
    default_packets_per_notification, perform_dfu, read_firmware_bundle, scan_for_devices,
    BleTransport, DfuError, DfuImageType, DfuOptions, DfuPhase, DfuResponseStatus, DfuResult,
    DfuTarget, DfuTransport, FirmwareBundle, FirmwareImage, LegacyDfu, Target,
};
