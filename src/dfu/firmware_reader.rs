//! Firmware bundle reader for Nordic DFU.
//!
//! Reads the ZIP produced by `nrfutil pkg generate`:
//! - manifest.json - names the image groups present and their files
//! - one or more image pairs: a `.bin` (raw firmware) and a `.dat`
//!   (init packet, consumed opaquely by the bootloader)

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use super::config::DfuImageType;
use super::error::{DfuError, DfuResult};
use super::packet::crc16_ccitt;

/// Contents of a DFU firmware bundle.
#[derive(Debug)]
pub struct FirmwareBundle {
    /// Bundle name (the ZIP's file stem), for logging.
    pub name: String,
    /// Images in transfer order: system images before the application.
    pub images: Vec<FirmwareImage>,
}

/// One transferable firmware image extracted from a bundle.
#[derive(Debug)]
pub struct FirmwareImage {
    pub image_type: DfuImageType,
    /// Init packet bytes (`.dat` contents).
    pub init_packet: Vec<u8>,
    /// Raw firmware bytes (`.bin` contents).
    pub firmware: Vec<u8>,
    /// Application version from the manifest, absent when the manifest
    /// carries the 0xFFFFFFFF "any version" sentinel.
    pub application_version: Option<u32>,
    /// Firmware CRC16 from the manifest, already verified against the
    /// firmware bytes when present.
    pub crc16: Option<u16>,
}

impl FirmwareImage {
    /// The three uint32 fields of the image-size header, in wire order
    /// `(softdevice, bootloader, application)`.
    ///
    /// Exactly one field is nonzero, matching the image-type bit.
    pub fn size_fields(&self) -> (u32, u32, u32) {
        let len = self.firmware.len() as u32;
        match self.image_type {
            DfuImageType::SoftDevice => (len, 0, 0),
            DfuImageType::Bootloader => (0, len, 0),
            DfuImageType::Application => (0, 0, len),
        }
    }
}

/// Raw manifest.json structure for deserialization.
#[derive(Debug, Deserialize)]
struct RawManifest {
    manifest: RawManifestInner,
}

#[derive(Debug, Deserialize)]
struct RawManifestInner {
    application: Option<RawImageGroup>,
    softdevice: Option<RawImageGroup>,
    bootloader: Option<RawImageGroup>,
    /// Combined softdevice+bootloader groups cannot be described by the
    /// single-nonzero-field size header; recognized only to reject them.
    softdevice_bootloader: Option<serde_json::Value>,
    #[allow(dead_code)]
    dfu_version: Option<f64>,
    /// Anything else the manifest declares; used to reject image groups
    /// outside the recognized set.
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawImageGroup {
    bin_file: String,
    dat_file: String,
    init_packet_data: Option<RawInitPacketData>,
}

#[derive(Debug, Default, Deserialize)]
struct RawInitPacketData {
    firmware_crc16: Option<u16>,
    application_version: Option<u32>,
}

/// Read and parse a Nordic DFU bundle.
///
/// Pure function of the archive bytes: no firmware content is validated
/// beyond the manifest's own CRC16 field (the target re-checks content CRC
/// during VALIDATE).
pub fn read_firmware_bundle<P: AsRef<Path>>(path: P) -> DfuResult<FirmwareBundle> {
    let path = path.as_ref();
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "firmware".to_string());

    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let raw = read_manifest(&mut archive)?;

    // Image groups outside the recognized set are combinations we cannot
    // encode in the START header.
    if raw.softdevice_bootloader.is_some() {
        return Err(DfuError::UnsupportedBundle {
            group: "softdevice_bootloader".to_string(),
        });
    }
    for (key, value) in &raw.extra {
        if value.get("bin_file").is_some() {
            return Err(DfuError::UnsupportedBundle { group: key.clone() });
        }
    }

    // Transfer order: the target must run the new softdevice/bootloader
    // before it can accept the application.
    let mut images = Vec::new();
    if let Some(group) = raw.softdevice {
        images.push(load_image(&mut archive, DfuImageType::SoftDevice, group)?);
    }
    if let Some(group) = raw.bootloader {
        images.push(load_image(&mut archive, DfuImageType::Bootloader, group)?);
    }
    if let Some(group) = raw.application {
        images.push(load_image(&mut archive, DfuImageType::Application, group)?);
    }

    if images.is_empty() {
        return Err(DfuError::MalformedBundle {
            reason: "manifest declares no firmware images".to_string(),
        });
    }

    Ok(FirmwareBundle { name, images })
}

/// Read and parse the manifest.json from the archive.
fn read_manifest(archive: &mut zip::ZipArchive<File>) -> DfuResult<RawManifestInner> {
    let mut manifest_file =
        archive
            .by_name("manifest.json")
            .map_err(|_| DfuError::MissingFile {
                filename: "manifest.json".to_string(),
            })?;

    let mut contents = String::new();
    manifest_file.read_to_string(&mut contents)?;

    let raw: RawManifest = serde_json::from_str(&contents)?;
    Ok(raw.manifest)
}

/// Load one image group: read its files and cross-check the manifest.
fn load_image(
    archive: &mut zip::ZipArchive<File>,
    image_type: DfuImageType,
    group: RawImageGroup,
) -> DfuResult<FirmwareImage> {
    let firmware = read_file_from_zip(archive, &group.bin_file)?;
    let init_packet = read_file_from_zip(archive, &group.dat_file)?;

    if firmware.is_empty() {
        return Err(DfuError::MalformedBundle {
            reason: format!("firmware file '{}' is empty", group.bin_file),
        });
    }
    if init_packet.is_empty() {
        return Err(DfuError::MalformedBundle {
            reason: format!("init packet '{}' is empty", group.dat_file),
        });
    }

    let ipd = group.init_packet_data.as_ref();
    if let Some(expected) = ipd.and_then(|d| d.firmware_crc16) {
        let actual = crc16_ccitt(&firmware);
        if actual != expected {
            return Err(DfuError::CrcMismatch { expected, actual });
        }
    }
    let application_version = ipd
        .and_then(|d| d.application_version)
        .filter(|&v| v != 0xFFFF_FFFF);

    Ok(FirmwareImage {
        image_type,
        init_packet,
        firmware,
        application_version,
        crc16: ipd.and_then(|d| d.firmware_crc16),
    })
}

/// Read a file from the zip archive by name.
fn read_file_from_zip(archive: &mut zip::ZipArchive<File>, name: &str) -> DfuResult<Vec<u8>> {
    let mut file = archive.by_name(name).map_err(|_| DfuError::MissingFile {
        filename: name.to_string(),
    })?;

    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)?;

    Ok(data)
}
