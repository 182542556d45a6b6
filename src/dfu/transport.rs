//! GATT session layer for DFU communication.
//!
//! Provides a trait-based abstraction over the two Legacy DFU
//! characteristics, enabling both real BLE hardware and mock testing.
//! Control-point notifications are pulled from a stream the state machine
//! polls; nothing is delivered through callbacks.

use std::pin::Pin;
use std::time::Duration;

use btleplug::api::{Characteristic, Peripheral as _, ValueNotification, WriteType};
use btleplug::platform::Peripheral;
use futures::{Stream, StreamExt};
use log::debug;

use super::config::{DFU_CONTROL_POINT_UUID, DFU_PACKET_UUID, DFU_VERSION_UUID};
use super::error::{DfuError, DfuResult};

/// Trait for DFU transport operations.
///
/// This abstraction allows for mocking in tests and keeps the state machine
/// independent of the BLE stack.
pub trait DfuTransport {
    /// Write to the DFU control-point characteristic.
    async fn write_control(&mut self, data: &[u8], with_response: bool) -> DfuResult<()>;

    /// Write without response to the DFU packet characteristic.
    async fn write_packet(&mut self, data: &[u8]) -> DfuResult<()>;

    /// Next control-point notification, in delivery order.
    ///
    /// Returns `Ok(None)` when the timeout elapses without a notification.
    async fn next_notification(&mut self, timeout: Duration) -> DfuResult<Option<Vec<u8>>>;

    /// Whether the underlying link is still up.
    async fn is_connected(&self) -> bool;

    /// Close the connection cleanly.
    async fn disconnect(&mut self) -> DfuResult<()>;
}

impl<T: DfuTransport> DfuTransport for &mut T {
    async fn write_control(&mut self, data: &[u8], with_response: bool) -> DfuResult<()> {
        (**self).write_control(data, with_response).await
    }

    async fn write_packet(&mut self, data: &[u8]) -> DfuResult<()> {
        (**self).write_packet(data).await
    }

    async fn next_notification(&mut self, timeout: Duration) -> DfuResult<Option<Vec<u8>>> {
        (**self).next_notification(timeout).await
    }

    async fn is_connected(&self) -> bool {
        (**self).is_connected().await
    }

    async fn disconnect(&mut self) -> DfuResult<()> {
        (**self).disconnect().await
    }
}

/// BLE GATT transport over a btleplug peripheral.
pub struct BleTransport {
    peripheral: Peripheral,
    control_point: Characteristic,
    packet: Characteristic,
    version: Option<Characteristic>,
    notifications: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
}

impl BleTransport {
    /// Connect to a peripheral and bind the Legacy DFU characteristics.
    ///
    /// Discovers services, resolves the control-point and packet
    /// characteristics, and subscribes to control-point notifications.
    /// A device without both characteristics is not a DFU target.
    pub async fn connect(peripheral: Peripheral) -> DfuResult<Self> {
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;

        let characteristics = peripheral.characteristics();
        let find = |uuid| characteristics.iter().find(|c| c.uuid == uuid).cloned();

        let control_point = find(DFU_CONTROL_POINT_UUID).ok_or(DfuError::NoDfuService)?;
        let packet = find(DFU_PACKET_UUID).ok_or(DfuError::NoDfuService)?;
        let version = find(DFU_VERSION_UUID);

        peripheral.subscribe(&control_point).await?;
        let notifications = peripheral.notifications().await?;

        Ok(Self {
            peripheral,
            control_point,
            packet,
            version,
            notifications,
        })
    }

    /// Read the bootloader version as `(major, minor)`, when the version
    /// characteristic is present and readable.
    pub async fn read_version(&self) -> Option<(u8, u8)> {
        let characteristic = self.version.as_ref()?;
        let data = self.peripheral.read(characteristic).await.ok()?;
        if data.len() < 2 {
            return None;
        }
        let raw = u16::from_le_bytes([data[0], data[1]]);
        Some(((raw >> 8) as u8, (raw & 0xFF) as u8))
    }
}

impl DfuTransport for BleTransport {
    async fn write_control(&mut self, data: &[u8], with_response: bool) -> DfuResult<()> {
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&self.control_point, data, write_type)
            .await?;
        Ok(())
    }

    async fn write_packet(&mut self, data: &[u8]) -> DfuResult<()> {
        self.peripheral
            .write(&self.packet, data, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn next_notification(&mut self, timeout: Duration) -> DfuResult<Option<Vec<u8>>> {
        let control_uuid = self.control_point.uuid;
        let wait = async {
            while let Some(notification) = self.notifications.next().await {
                if notification.uuid == control_uuid {
                    return Some(notification.value);
                }
                debug!(
                    "ignoring notification from unrelated characteristic {}",
                    notification.uuid
                );
            }
            None
        };

        match tokio::time::timeout(timeout, wait).await {
            // Stream exhausted: the peripheral is gone
            Ok(None) => Err(DfuError::Disconnected {
                operation: "notification wait",
            }),
            Ok(value) => Ok(value),
            Err(_) => Ok(None),
        }
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&mut self) -> DfuResult<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
