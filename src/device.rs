//! fx2lafw device implementation
//!
//! This module provides the `Fx2lafw` struct for opening FX2-based logic
//! analyzers that already run the fx2lafw firmware and streaming samples
//! from them.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::bounded;
use rusb::{Device, DeviceHandle, GlobalContext};

use crate::acquisition::{AbortHandle, Acquisition};
use crate::constants::*;
use crate::context::DeviceContext;
use crate::error::{Fx2lafwError, Result};
use crate::profile::{find_profile, is_supported_id, DeviceProfile, SUPPORTED_PROFILES};
use crate::registry::RenumerationRegistry;
use crate::stream::{AcquisitionSummary, SampleSink};
use crate::structures::VersionInfo;
use crate::transfer::PoolParams;
use crate::usb::{RusbBackend, RusbTransport};

/// fx2lafw device handle
///
/// # Example
///
/// ```no_run
/// use fx2lafw::{AbortHandle, Fx2lafw, Packet, RenumerationRegistry};
///
/// let registry = RenumerationRegistry::new();
/// let mut devices = Fx2lafw::scan(&registry)?;
/// let Some(dev) = devices.first_mut() else {
///     println!("No fx2lafw device found");
///     return Ok(());
/// };
///
/// dev.context_mut().set_samplerate(1_000_000)?;
/// dev.context_mut().set_limit_samples(Some(10_000));
///
/// let mut total = 0;
/// let summary = dev.acquire(
///     |packet: Packet<'_>| {
///         if let Packet::Logic(logic) = packet {
///             total += logic.len();
///         }
///     },
///     &AbortHandle::new(),
/// )?;
/// println!("{} samples, {:?}", summary.sent_samples, summary.outcome);
/// # Ok::<(), fx2lafw::Fx2lafwError>(())
/// ```
pub struct Fx2lafw {
    /// USB device handle, shared with the transfer backend during acquisition
    handle: Arc<DeviceHandle<GlobalContext>>,
    /// Capture configuration
    context: DeviceContext,
    /// Firmware version reported at open
    version: VersionInfo,
    /// FX2 silicon revision
    revid: u8,
    /// USB bus number
    bus: u8,
    /// USB device address
    address: u8,
}

impl Fx2lafw {
    /// Open a device that runs the fx2lafw firmware
    ///
    /// Refused with a retryable error while a device of the same family is
    /// renumerating after a firmware upload.
    pub fn open(device: &Device<GlobalContext>, registry: &RenumerationRegistry) -> Result<Self> {
        let desc = device.device_descriptor()?;
        let (vid, pid) = (desc.vendor_id(), desc.product_id());
        let family = SUPPORTED_PROFILES
            .iter()
            .find(|p| p.vid == vid && p.pid == pid)
            .map(|p| p.variant.family())
            .ok_or(Fx2lafwError::DeviceNotFound)?;
        registry.check_open_now(family)?;

        let mut handle = device.open()?;
        let manufacturer = handle
            .read_manufacturer_string_ascii(&desc)
            .unwrap_or_default();
        let product = handle.read_product_string_ascii(&desc).unwrap_or_default();
        let profile = find_profile(vid, pid, &manufacturer, &product)
            .ok_or(Fx2lafwError::DeviceNotFound)?;
        if !profile.has_firmware(&manufacturer, &product) {
            return Err(Fx2lafwError::FirmwareNotLoaded {
                firmware: profile.firmware,
            });
        }

        if handle.active_configuration().ok() != Some(USB_CONFIGURATION) {
            handle.set_active_configuration(USB_CONFIGURATION)?;
        }

        // Detach kernel driver on Linux/Unix
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if handle.kernel_driver_active(USB_INTERFACE).unwrap_or(false) {
                handle
                    .detach_kernel_driver(USB_INTERFACE)
                    .map_err(Fx2lafwError::DetachKernelDriver)?;
            }
        }

        let reply = control_in(&handle, CMD_GET_FW_VERSION, VersionInfo::SIZE)?;
        let version = VersionInfo::unpack(&reply)?;
        version.check_compatible()?;

        let revid = control_in(&handle, CMD_GET_REVID_VERSION, 1)?[0];

        handle
            .claim_interface(USB_INTERFACE)
            .map_err(Fx2lafwError::ClaimInterface)?;

        let dev = Self {
            handle: Arc::new(handle),
            context: DeviceContext::new(profile),
            version,
            revid,
            bus: device.bus_number(),
            address: device.address(),
        };
        log::info!(
            "Opened {} on bus {} address {}, firmware {}, {} (REVID {})",
            profile,
            dev.bus,
            dev.address,
            dev.version,
            revid_name(dev.revid),
            dev.revid
        );
        Ok(dev)
    }

    /// Get the device profile
    pub fn profile(&self) -> &'static DeviceProfile {
        self.context.profile()
    }

    /// Get the firmware version
    pub fn firmware_version(&self) -> VersionInfo {
        self.version
    }

    /// Get the FX2 silicon revision
    pub fn revid(&self) -> u8 {
        self.revid
    }

    /// Get the USB bus number
    pub fn bus(&self) -> u8 {
        self.bus
    }

    /// Get the USB device address
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Capture configuration
    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    /// Capture configuration, for changing settings between captures
    pub fn context_mut(&mut self) -> &mut DeviceContext {
        &mut self.context
    }

    /// Send the start command for the current settings
    ///
    /// The device begins streaming on its bulk endpoint immediately, so
    /// transfers should already be queued. `acquire` does both.
    pub fn start_acquisition(&self) -> Result<()> {
        let command = self.context.start_command()?;
        log::info!("Starting capture: {}", command);
        control_out(&self.handle, CMD_START, &command.pack())
    }

    /// Capture samples into `sink` until the limit, an abort or a fault
    ///
    /// Blocks the calling thread. `abort` may be triggered from another thread.
    pub fn acquire<S: SampleSink>(
        &mut self,
        sink: S,
        abort: &AbortHandle,
    ) -> Result<AcquisitionSummary> {
        let command = self.context.start_command()?;
        let params =
            PoolParams::for_samplerate(self.context.samplerate(), self.context.sample_width());
        log::info!(
            "Acquiring at {} Hz, {}-bit, {} transfers of {} bytes, timeout {} ms",
            self.context.samplerate(),
            self.context.sample_width().bits(),
            params.num_transfers,
            params.buffer_size,
            params.timeout.as_millis()
        );

        // Every transfer may complete before the dispatch loop wakes up
        let (tx, rx) = bounded(params.num_transfers);
        let transport = RusbTransport::new(RusbBackend::new(self.handle.clone()), tx)?;
        let mut acquisition = Acquisition::new(&self.context, params, transport, sink)
            .with_abort_handle(abort.clone());

        acquisition.start()?;
        if !acquisition.is_aborted() {
            log::debug!("Start command: {}", command);
            if let Err(e) = control_out(&self.handle, CMD_START, &command.pack()) {
                acquisition.fail(e);
            }
        }
        acquisition.run(&rx)
    }

    /// Scan for devices running the fx2lafw firmware
    ///
    /// Supported devices that cannot be opened (no firmware yet, renumerating,
    /// busy) are logged and skipped.
    pub fn scan(registry: &RenumerationRegistry) -> Result<Vec<Fx2lafw>> {
        let mut devices = Vec::new();

        for device in rusb::devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };
            if !is_supported_id(desc.vendor_id(), desc.product_id()) {
                continue;
            }

            match Self::open(&device, registry) {
                Ok(dev) => devices.push(dev),
                Err(e @ Fx2lafwError::FirmwareNotLoaded { .. })
                | Err(e @ Fx2lafwError::RenumerationPending { .. }) => log::info!(
                    "Skipping {:04x}:{:04x} on bus {} address {}: {}",
                    desc.vendor_id(),
                    desc.product_id(),
                    device.bus_number(),
                    device.address(),
                    e
                ),
                Err(e) => log::warn!(
                    "Failed to open {:04x}:{:04x} on bus {} address {}: {}",
                    desc.vendor_id(),
                    desc.product_id(),
                    device.bus_number(),
                    device.address(),
                    e
                ),
            }
        }

        Ok(devices)
    }

    /// Open a specific device by bus and address
    pub fn find(bus: u8, address: u8, registry: &RenumerationRegistry) -> Result<Option<Fx2lafw>> {
        for device in rusb::devices()?.iter() {
            if device.bus_number() != bus || device.address() != address {
                continue;
            }

            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };

            if is_supported_id(desc.vendor_id(), desc.product_id()) {
                return Self::open(&device, registry).map(Some);
            }
        }

        Ok(None)
    }
}

/// Perform a vendor control OUT transfer
fn control_out(handle: &DeviceHandle<GlobalContext>, request: u8, data: &[u8]) -> Result<()> {
    handle
        .write_control(
            VENDOR_REQUEST_OUT,
            request,
            0,
            0,
            data,
            Duration::from_millis(USB_TIMEOUT_MS),
        )
        .map_err(Fx2lafwError::ControlTransfer)?;
    Ok(())
}

/// Perform a vendor control IN transfer expecting exactly `length` bytes
fn control_in(handle: &DeviceHandle<GlobalContext>, request: u8, length: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; length];
    let len = handle
        .read_control(
            VENDOR_REQUEST_IN,
            request,
            0,
            0,
            &mut buf,
            Duration::from_millis(USB_TIMEOUT_MS),
        )
        .map_err(Fx2lafwError::ControlTransfer)?;

    if len != length {
        return Err(Fx2lafwError::InvalidResponse {
            expected: length,
            actual: len,
        });
    }

    Ok(buf)
}

impl std::fmt::Display for Fx2lafw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (bus {}, addr {})",
            self.profile(),
            self.bus,
            self.address
        )
    }
}

impl std::fmt::Debug for Fx2lafw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fx2lafw")
            .field("bus", &self.bus)
            .field("address", &self.address)
            .field("model", &self.profile().model)
            .field("version", &format_args!("{}", self.version))
            .field("revid", &self.revid)
            .field("samplerate", &self.context.samplerate())
            .finish()
    }
}

impl Drop for Fx2lafw {
    fn drop(&mut self) {
        // The transfer backend holds no clone once an acquisition has returned
        if let Some(handle) = Arc::get_mut(&mut self.handle) {
            // Ignore errors, the device may already be gone
            let _ = handle.release_interface(USB_INTERFACE);
        }
    }
}
