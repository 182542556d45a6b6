//! Legacy DFU protocol driver.
//!
//! Drives the bootloader conversation over a [`DfuTransport`]:
//! 1. StartDfu - announce image type and sizes
//! 2. InitDfuParams - deliver the init packet
//! 3. ReceiveFirmwareImage - stream firmware under receipt-based flow control
//! 4. ValidateFirmware - on-device CRC check
//! 5. ActivateAndReset - the target reboots into the new image
//!
//! [`perform_dfu`] composes the driver with bundle parsing, device
//! resolution, the buttonless trigger, and bootloader rediscovery.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use btleplug::platform::Adapter;
use log::{debug, info, warn};
use tokio::time::{sleep, Instant};

use super::config::{
    default_packets_per_notification, DfuOpcode, DfuResponseStatus,
    ACTIVATION_DISCONNECT_TIMEOUT, ACTIVATION_POLL_INTERVAL, CONNECT_ATTEMPTS,
    CONNECT_RETRY_DELAY, INIT_SETTLE_DELAY, PACKET_SIZE, REBOOT_SETTLE_DELAY,
    REDISCOVERY_TIMEOUT, RESPONSE_TIMEOUT, SCAN_BURST,
};
use super::device::{self, DfuTarget};
use super::error::{DfuError, DfuResult};
use super::firmware_reader::{read_firmware_bundle, FirmwareImage};
use super::packet::{self, Crc16, Notification};
use super::transport::{BleTransport, DfuTransport};

/// Phases of one DFU session, in conversation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuPhase {
    Idle,
    Start,
    Init,
    TransferPrep,
    Transfer,
    Validate,
    Activate,
    Complete,
    Failed,
}

impl DfuPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DfuPhase::Idle => "idle",
            DfuPhase::Start => "start",
            DfuPhase::Init => "init",
            DfuPhase::TransferPrep => "transfer-prep",
            DfuPhase::Transfer => "transfer",
            DfuPhase::Validate => "validate",
            DfuPhase::Activate => "activate",
            DfuPhase::Complete => "complete",
            DfuPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for DfuPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Legacy DFU state machine over an abstract transport.
///
/// One instance drives one image through the full conversation. All
/// notifications are pulled from the transport in arrival order; nothing
/// else touches the connection during a session.
pub struct LegacyDfu<T, P, L>
where
    T: DfuTransport,
    P: Fn(f32),
    L: Fn(&str),
{
    transport: T,
    packets_per_notification: u16,
    response_timeout: Duration,
    phase: DfuPhase,
    on_progress: P,
    log: L,
}

impl<T, P, L> LegacyDfu<T, P, L>
where
    T: DfuTransport,
    P: Fn(f32),
    L: Fn(&str),
{
    /// Create a new session over `transport`.
    ///
    /// `packets_per_notification` caps how many 20-byte packets are written
    /// between receipt notifications; see the flow-control notes on
    /// [`default_packets_per_notification`].
    pub fn new(transport: T, packets_per_notification: u16, on_progress: P, log: L) -> Self {
        Self {
            transport,
            packets_per_notification: packets_per_notification.max(1),
            response_timeout: RESPONSE_TIMEOUT,
            phase: DfuPhase::Idle,
            on_progress,
            log,
        }
    }

    /// Current phase, for diagnostics.
    pub fn phase(&self) -> DfuPhase {
        self.phase
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Drive one firmware image through the full update conversation.
    pub async fn run(&mut self, image: &FirmwareImage) -> DfuResult<()> {
        let result = self.run_inner(image).await;
        self.phase = match &result {
            Ok(()) => DfuPhase::Complete,
            Err(_) => DfuPhase::Failed,
        };
        result
    }

    async fn run_inner(&mut self, image: &FirmwareImage) -> DfuResult<()> {
        self.start_dfu(image).await?;
        self.init_dfu(&image.init_packet).await?;
        self.transfer_firmware(&image.firmware).await?;
        self.validate().await?;
        self.activate_and_reset().await
    }

    /// Send StartDfu with the image type, followed by the size header on
    /// the packet characteristic.
    pub async fn start_dfu(&mut self, image: &FirmwareImage) -> DfuResult<()> {
        self.phase = DfuPhase::Start;
        let (softdevice, bootloader, application) = image.size_fields();
        (self.log)(&format!(
            "Starting DFU: {:?} image, {} bytes",
            image.image_type,
            image.firmware.len()
        ));

        self.transport
            .write_control(&packet::start_dfu_request(image.image_type), true)
            .await?;
        self.transport
            .write_packet(&packet::image_size_packet(
                softdevice,
                bootloader,
                application,
            ))
            .await?;

        self.await_success(DfuOpcode::StartDfu).await
    }

    /// Deliver the init packet in 20-byte chunks, bracketed by the
    /// receive/complete InitDfuParams commands.
    pub async fn init_dfu(&mut self, init_packet: &[u8]) -> DfuResult<()> {
        self.phase = DfuPhase::Init;
        debug!("sending init packet ({} bytes)", init_packet.len());

        self.transport
            .write_control(&packet::init_params_request(false), true)
            .await?;
        sleep(INIT_SETTLE_DELAY).await;

        for chunk in init_packet.chunks(PACKET_SIZE) {
            self.transport.write_packet(chunk).await?;
        }

        self.transport
            .write_control(&packet::init_params_request(true), true)
            .await?;

        self.await_success(DfuOpcode::InitDfuParams).await
    }

    /// Stream the firmware image under receipt-notification flow control.
    pub async fn transfer_firmware(&mut self, firmware: &[u8]) -> DfuResult<()> {
        self.phase = DfuPhase::TransferPrep;
        (self.log)(&format!("Sending firmware ({} bytes)...", firmware.len()));

        self.transport
            .write_control(
                &packet::packet_receipt_interval_request(self.packets_per_notification),
                true,
            )
            .await?;
        self.transport
            .write_control(&packet::receive_firmware_request(), true)
            .await?;

        self.phase = DfuPhase::Transfer;
        let total = firmware.len();
        let mut bytes_sent: usize = 0;
        let mut packets_since_receipt: u16 = 0;
        let mut crc = Crc16::new();

        for chunk in firmware.chunks(PACKET_SIZE) {
            self.transport.write_packet(chunk).await?;
            bytes_sent += chunk.len();
            crc.update(chunk);
            packets_since_receipt += 1;

            // The window is full: the bootloader owes us a receipt before
            // we may send more.
            if packets_since_receipt >= self.packets_per_notification && bytes_sent < total {
                self.await_receipt(bytes_sent).await?;
                packets_since_receipt = 0;
                self.emit_progress(bytes_sent, total);
            }
        }

        // Final stretch: drain the last receipt (if the image ended on a
        // window boundary) and the response to ReceiveFirmwareImage.
        loop {
            match self.next_parsed().await? {
                Notification::PacketReceipt { bytes_received } => {
                    verify_receipt(bytes_received, bytes_sent)?;
                    self.emit_progress(bytes_received as usize, total);
                }
                Notification::Response { request, status } => {
                    self.check_response(DfuOpcode::ReceiveFirmwareImage, request, status)?;
                    break;
                }
            }
        }

        (self.log)(&format!(
            "Firmware transfer complete ({bytes_sent} bytes, CRC 0x{:04X})",
            crc.value()
        ));
        self.emit_progress(total, total);
        Ok(())
    }

    /// Ask the bootloader to validate the received image.
    pub async fn validate(&mut self) -> DfuResult<()> {
        self.phase = DfuPhase::Validate;
        self.transport
            .write_control(&packet::validate_request(), true)
            .await?;
        self.await_success(DfuOpcode::ValidateFirmware).await
    }

    /// Send ActivateAndReset and treat a disconnect as success.
    ///
    /// The target reboots immediately, so no response arrives; the link
    /// dropping within the activation window is the success signal.
    pub async fn activate_and_reset(&mut self) -> DfuResult<()> {
        self.phase = DfuPhase::Activate;
        (self.log)("Activating new firmware...");

        if let Err(e) = self
            .transport
            .write_control(&packet::activate_request(), true)
            .await
        {
            // The reset can race the write acknowledgement.
            debug!("activate write failed (reboot expected): {e}");
        }

        let deadline = Instant::now() + ACTIVATION_DISCONNECT_TIMEOUT;
        while Instant::now() < deadline {
            if !self.transport.is_connected().await {
                (self.log)("Target disconnected to reboot into the new firmware");
                return Ok(());
            }
            sleep(ACTIVATION_POLL_INTERVAL).await;
        }

        Err(DfuError::ActivationTimeout)
    }

    /// Next notification, parsed; a transport timeout becomes a phase-tagged
    /// timeout error.
    async fn next_parsed(&mut self) -> DfuResult<Notification> {
        let raw = self
            .transport
            .next_notification(self.response_timeout)
            .await?
            .ok_or(DfuError::Timeout { phase: self.phase })?;
        Notification::parse(&raw)
    }

    /// Await the mid-transfer receipt for the current window.
    async fn await_receipt(&mut self, bytes_sent: usize) -> DfuResult<()> {
        match self.next_parsed().await? {
            Notification::PacketReceipt { bytes_received } => {
                verify_receipt(bytes_received, bytes_sent)
            }
            Notification::Response { request, status } => {
                // A response mid-transfer is the bootloader aborting.
                self.check_response(DfuOpcode::ReceiveFirmwareImage, request, status)?;
                Err(DfuError::UnexpectedNotification(vec![
                    DfuOpcode::Response as u8,
                    request,
                    status as u8,
                ]))
            }
        }
    }

    /// Await a SUCCESS response to `request`, skipping stale receipts.
    async fn await_success(&mut self, request: DfuOpcode) -> DfuResult<()> {
        loop {
            match self.next_parsed().await? {
                Notification::PacketReceipt { bytes_received } => {
                    debug!("draining stale receipt ({bytes_received} bytes)");
                }
                Notification::Response { request: got, status } => {
                    return self.check_response(request, got, status);
                }
            }
        }
    }

    fn check_response(
        &self,
        expected: DfuOpcode,
        got: u8,
        status: DfuResponseStatus,
    ) -> DfuResult<()> {
        if got != expected as u8 {
            return Err(DfuError::UnexpectedNotification(vec![
                DfuOpcode::Response as u8,
                got,
                status as u8,
            ]));
        }
        if status != DfuResponseStatus::Success {
            warn!("request 0x{got:02X} rejected in {} phase: {status}", self.phase);
            return Err(DfuError::Response {
                request: got,
                status,
            });
        }
        Ok(())
    }

    fn emit_progress(&self, sent: usize, total: usize) {
        if total == 0 {
            return;
        }
        (self.on_progress)(100.0 * sent as f32 / total as f32);
    }
}

fn verify_receipt(reported: u32, sent: usize) -> DfuResult<()> {
    if reported as usize != sent {
        return Err(DfuError::ByteCountMismatch {
            reported,
            sent: sent as u32,
        });
    }
    Ok(())
}

// ============================================================================
// Orchestration
// ============================================================================

/// Caller-tunable knobs for [`perform_dfu`].
#[derive(Debug, Clone)]
pub struct DfuOptions {
    /// Packets written between receipt notifications. Default: 8 on macOS
    /// (CoreBluetooth flow-control limit), 10 elsewhere.
    pub packets_per_notification: u16,
    /// Scan window used when resolving a device selector.
    pub scan_timeout: Duration,
}

impl Default for DfuOptions {
    fn default() -> Self {
        Self {
            packets_per_notification: default_packets_per_notification(),
            scan_timeout: Duration::from_secs(5),
        }
    }
}

/// Device argument to [`perform_dfu`]: a handle from a previous scan, or a
/// name/address selector that triggers a fresh scan.
pub enum Target {
    Device(DfuTarget),
    Selector(String),
}

impl From<DfuTarget> for Target {
    fn from(target: DfuTarget) -> Self {
        Target::Device(target)
    }
}

impl From<&str> for Target {
    fn from(selector: &str) -> Self {
        Target::Selector(selector.to_string())
    }
}

impl From<String> for Target {
    fn from(selector: String) -> Self {
        Target::Selector(selector)
    }
}

/// Perform a complete Nordic Legacy DFU firmware update over BLE.
///
/// Handles the full flow: bundle parsing, device resolution, the buttonless
/// bootloader trigger, rediscovery after reboot, and one protocol session
/// per image in the bundle. Progress percentages (0-100 per image) go to
/// `on_progress`; human-readable status lines go to `on_log`.
///
/// Nothing is retried across a failure; callers decide whether to rerun,
/// and the bootloader persists until a transfer activates, so a retry
/// simply starts over at StartDfu.
pub async fn perform_dfu<P, L>(
    zip_path: impl AsRef<Path>,
    device: impl Into<Target>,
    options: &DfuOptions,
    on_progress: P,
    on_log: L,
) -> DfuResult<()>
where
    P: Fn(f32),
    L: Fn(&str),
{
    let bundle = read_firmware_bundle(&zip_path)?;
    for image in &bundle.images {
        let crc = image
            .crc16
            .map(|c| format!(", CRC 0x{c:04X}"))
            .unwrap_or_default();
        let version = image
            .application_version
            .map(|v| format!(", v{v}"))
            .unwrap_or_default();
        on_log(&format!(
            "Bundle '{}': {:?} image, {} bytes{crc}{version}",
            bundle.name,
            image.image_type,
            image.firmware.len()
        ));
    }

    let adapter = device::default_adapter().await?;

    let target = match device.into() {
        Target::Device(target) => target,
        Target::Selector(selector) => {
            on_log(&format!("Scanning for '{selector}'..."));
            device::resolve_device(&adapter, &selector, options.scan_timeout).await?
        }
    };
    let original_address = target.address.clone();
    let original_name = target.name.clone();

    let image_count = bundle.images.len();
    let mut current = Some(target);

    for (index, image) in bundle.images.iter().enumerate() {
        let target = match current.take() {
            Some(target) => target,
            None => {
                // The previous activation rebooted the target; find it again.
                on_log("Waiting for target to reboot before the next image...");
                sleep(REBOOT_SETTLE_DELAY).await;
                device::find_dfu_target(
                    &adapter,
                    &original_address,
                    original_name.as_deref(),
                    REDISCOVERY_TIMEOUT,
                )
                .await?
            }
        };

        let target = ensure_bootloader(
            &adapter,
            target,
            &original_address,
            original_name.as_deref(),
            &on_log,
        )
        .await?;

        on_log(&format!("Connecting to {}...", target.display_label()));
        let transport = connect_with_retry(
            &adapter,
            target,
            &original_address,
            original_name.as_deref(),
            &on_log,
        )
        .await?;

        if let Some((major, minor)) = transport.read_version().await {
            on_log(&format!("DFU bootloader version {major}.{minor}"));
        }

        if image_count > 1 {
            on_log(&format!("Transferring image {}/{image_count}", index + 1));
        }

        let mut session = LegacyDfu::new(
            transport,
            options.packets_per_notification,
            &on_progress,
            &on_log,
        );
        if let Err(e) = session.run(image).await {
            warn!("DFU failed in {} phase: {e}", session.phase());
            let _ = session.transport_mut().disconnect().await;
            return Err(e);
        }
    }

    info!("DFU complete for bundle '{}'", bundle.name);
    on_log("DFU complete: target is rebooting with the new firmware");
    Ok(())
}

/// Make sure the target is in bootloader mode, triggering a reboot out of
/// application mode when needed.
async fn ensure_bootloader<L: Fn(&str)>(
    adapter: &Adapter,
    target: DfuTarget,
    original_address: &str,
    original_name: Option<&str>,
    on_log: &L,
) -> DfuResult<DfuTarget> {
    if target.in_bootloader() {
        return Ok(target);
    }

    on_log(&format!(
        "{} is in application mode; triggering bootloader...",
        target.display_label()
    ));
    device::trigger_bootloader(&target).await?;
    sleep(REBOOT_SETTLE_DELAY).await;

    on_log("Waiting for the bootloader to advertise...");
    device::find_dfu_target(adapter, original_address, original_name, REDISCOVERY_TIMEOUT).await
}

/// Connect to the bootloader, rescanning for a fresh advertisement between
/// attempts.
///
/// Freshly rebooted bootloaders routinely miss the first connect request,
/// and a cached peripheral handle can go stale across the reboot, so each
/// retry starts from a new scan.
async fn connect_with_retry<L: Fn(&str)>(
    adapter: &Adapter,
    target: DfuTarget,
    original_address: &str,
    original_name: Option<&str>,
    on_log: &L,
) -> DfuResult<BleTransport> {
    let mut candidate = Some(target);
    let mut last_error: Option<DfuError> = None;

    for attempt in 1..=CONNECT_ATTEMPTS {
        if attempt > 1 {
            sleep(CONNECT_RETRY_DELAY).await;
        }

        let target = match candidate.take() {
            Some(target) => target,
            None => {
                match device::find_dfu_target(
                    adapter,
                    original_address,
                    original_name,
                    SCAN_BURST + SCAN_BURST,
                )
                .await
                {
                    Ok(target) => target,
                    Err(e) => {
                        debug!("rescan before attempt {attempt} failed: {e}");
                        last_error = Some(e);
                        continue;
                    }
                }
            }
        };

        match BleTransport::connect(target.peripheral.clone()).await {
            Ok(transport) => return Ok(transport),
            // Not transient: the device simply has no DFU service.
            Err(DfuError::NoDfuService) => return Err(DfuError::NoDfuService),
            Err(e) => {
                on_log(&format!(
                    "Connection attempt {attempt}/{CONNECT_ATTEMPTS} failed: {e}"
                ));
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| DfuError::DeviceNotFound {
        detail: format!("could not connect to {original_address}"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use crate::dfu::config::DfuImageType;

    /// Scripted control-point notification.
    enum Reply {
        /// `[0x10, request, status]`
        Response(u8, u8),
        /// Receipt carrying the mock's own count of firmware bytes.
        Receipt,
        /// Receipt with the count shifted by a delta (fault injection).
        ReceiptSkewed(i64),
    }

    /// In-memory transport: records writes, serves scripted notifications.
    /// An empty script queue behaves like a notification timeout.
    struct MockTransport {
        replies: VecDeque<Reply>,
        control_writes: Vec<(Vec<u8>, bool)>,
        packet_writes: Vec<Vec<u8>>,
        firmware_bytes: u32,
        firmware_packets: usize,
        receiving: bool,
        packets_since_wait: usize,
        max_packets_between_waits: usize,
        transfer_waits: usize,
        connected: bool,
        drop_on_activate: bool,
    }

    impl MockTransport {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: replies.into(),
                control_writes: Vec::new(),
                packet_writes: Vec::new(),
                firmware_bytes: 0,
                firmware_packets: 0,
                receiving: false,
                packets_since_wait: 0,
                max_packets_between_waits: 0,
                transfer_waits: 0,
                connected: true,
                drop_on_activate: true,
            }
        }

        fn keep_connection_on_activate(mut self) -> Self {
            self.drop_on_activate = false;
            self
        }
    }

    impl DfuTransport for MockTransport {
        async fn write_control(&mut self, data: &[u8], with_response: bool) -> DfuResult<()> {
            match data.first() {
                Some(&op) if op == DfuOpcode::ReceiveFirmwareImage as u8 && data.len() == 1 => {
                    self.receiving = true;
                    self.firmware_bytes = 0;
                }
                Some(&op) if op == DfuOpcode::ValidateFirmware as u8 => {
                    self.receiving = false;
                }
                Some(&op) if op == DfuOpcode::ActivateAndReset as u8 => {
                    if self.drop_on_activate {
                        self.connected = false;
                    }
                }
                _ => {}
            }
            self.control_writes.push((data.to_vec(), with_response));
            Ok(())
        }

        async fn write_packet(&mut self, data: &[u8]) -> DfuResult<()> {
            if self.receiving {
                self.firmware_bytes += data.len() as u32;
                self.firmware_packets += 1;
                self.packets_since_wait += 1;
                self.max_packets_between_waits =
                    self.max_packets_between_waits.max(self.packets_since_wait);
            }
            self.packet_writes.push(data.to_vec());
            Ok(())
        }

        async fn next_notification(&mut self, _timeout: Duration) -> DfuResult<Option<Vec<u8>>> {
            if self.receiving {
                self.transfer_waits += 1;
            }
            self.packets_since_wait = 0;
            match self.replies.pop_front() {
                None => Ok(None),
                Some(Reply::Response(request, status)) => {
                    Ok(Some(vec![DfuOpcode::Response as u8, request, status]))
                }
                Some(Reply::Receipt) => {
                    let mut frame = vec![DfuOpcode::PacketReceiptNotification as u8];
                    frame.extend_from_slice(&self.firmware_bytes.to_le_bytes());
                    Ok(Some(frame))
                }
                Some(Reply::ReceiptSkewed(delta)) => {
                    let count = (self.firmware_bytes as i64 + delta) as u32;
                    let mut frame = vec![DfuOpcode::PacketReceiptNotification as u8];
                    frame.extend_from_slice(&count.to_le_bytes());
                    Ok(Some(frame))
                }
            }
        }

        async fn is_connected(&self) -> bool {
            self.connected
        }

        async fn disconnect(&mut self) -> DfuResult<()> {
            self.connected = false;
            Ok(())
        }
    }

    fn application_image(firmware: Vec<u8>) -> FirmwareImage {
        FirmwareImage {
            image_type: DfuImageType::Application,
            init_packet: vec![0xAA; 32],
            firmware,
            application_version: None,
            crc16: None,
        }
    }

    fn happy_path_replies(receipts: usize) -> Vec<Reply> {
        let mut replies = vec![
            Reply::Response(DfuOpcode::StartDfu as u8, 0x01),
            Reply::Response(DfuOpcode::InitDfuParams as u8, 0x01),
        ];
        replies.extend((0..receipts).map(|_| Reply::Receipt));
        replies.push(Reply::Response(DfuOpcode::ReceiveFirmwareImage as u8, 0x01));
        replies.push(Reply::Response(DfuOpcode::ValidateFirmware as u8, 0x01));
        replies
    }

    #[tokio::test(start_paused = true)]
    async fn transfers_application_image_end_to_end() {
        let image = application_image(vec![0x5A; 4096]);
        // 205 packets with PRN=10: receipts after packets 10..200
        let mut mock = MockTransport::new(happy_path_replies(20));
        let progress: RefCell<Vec<f32>> = RefCell::new(Vec::new());

        let mut dfu = LegacyDfu::new(
            &mut mock,
            10,
            |p| progress.borrow_mut().push(p),
            |_| {},
        );
        dfu.run(&image).await.unwrap();
        assert_eq!(dfu.phase(), DfuPhase::Complete);

        // Exactly one StartDfu request with the application type code
        let starts: Vec<_> = mock
            .control_writes
            .iter()
            .filter(|(data, _)| data.first() == Some(&0x01))
            .collect();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].0, vec![0x01, 0x04]);

        // Size header first on the packet characteristic: (0, 0, 4096)
        assert_eq!(
            mock.packet_writes[0],
            vec![0, 0, 0, 0, 0, 0, 0, 0, 0x00, 0x10, 0x00, 0x00]
        );

        // 4096 / 20 = 205 data packets, final packet 16 bytes
        assert_eq!(mock.firmware_packets, 205);
        assert_eq!(mock.packet_writes.last().unwrap().len(), 16);

        // Receipt-driven progress: non-decreasing, ending at exactly 100
        let progress = progress.into_inner();
        assert!(!progress.is_empty());
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*progress.last().unwrap(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn enforces_receipt_window() {
        // 1000 bytes = 50 packets; PRN=8 means receipts after 8..48
        let image = application_image(vec![0x11; 1000]);
        let mut mock = MockTransport::new(happy_path_replies(6));

        let mut dfu = LegacyDfu::new(&mut mock, 8, |_| {}, |_| {});
        dfu.run(&image).await.unwrap();

        // ceil(50 / 8) = 7 notification waits during the transfer
        assert!(mock.transfer_waits >= 7);
        // Never more than the window between two waits
        assert!(mock.max_packets_between_waits <= 8);
        assert_eq!(mock.firmware_packets, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn aborts_on_receipt_byte_count_mismatch() {
        let image = application_image(vec![0x22; 1000]);
        let mut mock = MockTransport::new(vec![
            Reply::Response(DfuOpcode::StartDfu as u8, 0x01),
            Reply::Response(DfuOpcode::InitDfuParams as u8, 0x01),
            Reply::ReceiptSkewed(-3),
        ]);

        let mut dfu = LegacyDfu::new(&mut mock, 10, |_| {}, |_| {});
        let err = dfu.run(&image).await.unwrap_err();

        assert!(matches!(
            err,
            DfuError::ByteCountMismatch {
                reported: 197,
                sent: 200
            }
        ));
        assert_eq!(dfu.phase(), DfuPhase::Failed);
        // No packets written after the mismatched receipt
        assert_eq!(mock.firmware_packets, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn aborts_on_non_success_status() {
        let image = application_image(vec![0x33; 100]);
        let mut mock = MockTransport::new(vec![
            Reply::Response(DfuOpcode::StartDfu as u8, 0x01),
            Reply::Response(DfuOpcode::InitDfuParams as u8, 0x05),
        ]);

        let mut dfu = LegacyDfu::new(&mut mock, 10, |_| {}, |_| {});
        let err = dfu.run(&image).await.unwrap_err();

        assert!(matches!(
            err,
            DfuError::Response {
                request: 0x02,
                status: DfuResponseStatus::CrcError
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn activation_disconnect_is_success() {
        let image = application_image(vec![0x44; 40]);
        let mut mock = MockTransport::new(happy_path_replies(0));

        let mut dfu = LegacyDfu::new(&mut mock, 10, |_| {}, |_| {});
        dfu.run(&image).await.unwrap();

        assert!(!mock.connected);
        // ActivateAndReset was the last control write
        assert_eq!(mock.control_writes.last().unwrap().0, vec![0x05]);
    }

    #[tokio::test(start_paused = true)]
    async fn activation_without_disconnect_times_out() {
        let image = application_image(vec![0x44; 40]);
        let mut mock =
            MockTransport::new(happy_path_replies(0)).keep_connection_on_activate();

        let mut dfu = LegacyDfu::new(&mut mock, 10, |_| {}, |_| {});
        let err = dfu.run(&image).await.unwrap_err();

        assert!(matches!(err, DfuError::ActivationTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn init_timeout_reports_phase() {
        let image = application_image(vec![0x55; 100]);
        // START is answered; INIT never is
        let mut mock =
            MockTransport::new(vec![Reply::Response(DfuOpcode::StartDfu as u8, 0x01)]);

        let mut dfu = LegacyDfu::new(&mut mock, 10, |_| {}, |_| {});
        let err = dfu.run(&image).await.unwrap_err();

        assert!(matches!(
            err,
            DfuError::Timeout {
                phase: DfuPhase::Init
            }
        ));
        assert_eq!(dfu.phase(), DfuPhase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_receipt_is_drained_before_response() {
        let image = application_image(vec![0x66; 100]);
        let mut mock = MockTransport::new(vec![
            Reply::Response(DfuOpcode::StartDfu as u8, 0x01),
            Reply::Response(DfuOpcode::InitDfuParams as u8, 0x01),
            Reply::Receipt, // image ends exactly on the window boundary
            Reply::Response(DfuOpcode::ReceiveFirmwareImage as u8, 0x01),
            Reply::Response(DfuOpcode::ValidateFirmware as u8, 0x01),
        ]);

        // 100 bytes = 5 packets = one full PRN=5 window
        let mut dfu = LegacyDfu::new(&mut mock, 5, |_| {}, |_| {});
        dfu.run(&image).await.unwrap();
        assert_eq!(dfu.phase(), DfuPhase::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn init_packet_is_chunked_to_packet_characteristic() {
        let mut image = application_image(vec![0x77; 20]);
        image.init_packet = vec![0xBB; 52]; // 3 chunks: 20 + 20 + 12
        let mut mock = MockTransport::new(happy_path_replies(0));

        let mut dfu = LegacyDfu::new(&mut mock, 10, |_| {}, |_| {});
        dfu.run(&image).await.unwrap();

        // size header + 3 init chunks + 1 firmware packet
        assert_eq!(mock.packet_writes.len(), 5);
        assert_eq!(mock.packet_writes[1].len(), 20);
        assert_eq!(mock.packet_writes[3].len(), 12);
        // Init bracketed by receive/complete commands
        assert!(mock
            .control_writes
            .iter()
            .any(|(data, _)| data == &vec![0x02, 0x00]));
        assert!(mock
            .control_writes
            .iter()
            .any(|(data, _)| data == &vec![0x02, 0x01]));
    }

    #[tokio::test(start_paused = true)]
    async fn prn_request_precedes_receive_command() {
        let image = application_image(vec![0x88; 40]);
        let mut mock = MockTransport::new(happy_path_replies(0));

        let mut dfu = LegacyDfu::new(&mut mock, 8, |_| {}, |_| {});
        dfu.run(&image).await.unwrap();

        let prn_index = mock
            .control_writes
            .iter()
            .position(|(data, _)| data == &vec![0x08, 0x08, 0x00])
            .expect("PRN request not sent");
        let receive_index = mock
            .control_writes
            .iter()
            .position(|(data, _)| data == &vec![0x03])
            .expect("receive command not sent");
        assert!(prn_index < receive_index);
    }
}
