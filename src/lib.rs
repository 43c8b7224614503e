//! fx2lafw Acquisition Core for Rust
//!
//! This crate drives Cypress FX2-based USB logic analyzers running the
//! open-source fx2lafw firmware: it encodes the vendor control commands,
//! keeps a pool of bulk transfers streaming, finds the trigger point in the
//! sample stream and hands finished sample packets to a caller-supplied sink.
//!
//! # Features
//!
//! - 8-bit and 16-bit sampling up to 24 MHz / 12 MHz
//! - GPIF clock divider selection (48 MHz or 30 MHz source)
//! - Multi-stage software trigger with pre-trigger capture ratio
//! - Sample limits with exact truncation, continuous capture without
//! - Analog channel split for USBee AX class devices
//! - Stall and disconnect detection, cancellation from any thread
//! - Renumeration guard after firmware uploads
//!
//! # Example
//!
//! ```no_run
//! use fx2lafw::{AbortHandle, Fx2lafw, Packet, RenumerationRegistry};
//!
//! fn main() -> fx2lafw::Result<()> {
//!     let registry = RenumerationRegistry::new();
//!     let devices = Fx2lafw::scan(&registry)?;
//!     let Some(mut dev) = devices.into_iter().next() else {
//!         println!("No fx2lafw device found");
//!         return Ok(());
//!     };
//!
//!     // 1 MHz, 8-bit, stop after 100k samples
//!     dev.context_mut().set_samplerate(1_000_000)?;
//!     dev.context_mut().set_limit_samples(Some(100_000));
//!
//!     let summary = dev.acquire(
//!         |packet: Packet<'_>| match packet {
//!             Packet::Logic(logic) => println!("{} samples", logic.len()),
//!             Packet::End(summary) => println!("done: {:?}", summary.outcome),
//!             _ => {}
//!         },
//!         &AbortHandle::new(),
//!     )?;
//!     println!("Captured {} samples", summary.sent_samples);
//!     Ok(())
//! }
//! ```
//!
//! # Supported Devices
//!
//! - CWAV USBee AX / DX / SX and clones (VID: 0x08A9)
//! - Saleae Logic and clones (VID: 0x0925, PID: 0x3881)
//! - Cypress FX2 without EEPROM (VID: 0x04B4, PID: 0x8613)
//! - Braintechnology USB-LPS (VID: 0x16D0, PID: 0x0498)
//! - sigrok FX2 LA 8ch / 16ch (VID: 0x1D50)
//! - DreamSourceLab DSLogic / DSCope / DSLogic Pro are recognised, but their
//!   FPGA bring-up is not handled here

pub mod acquisition;
pub mod constants;
pub mod context;
pub mod device;
pub mod error;
pub mod profile;
pub mod registry;
pub mod stream;
pub mod structures;
pub mod transfer;
pub mod trigger;
pub mod usb;

// Re-export main types at crate root
pub use constants::{
    // Commands
    CMD_GET_FW_VERSION,
    CMD_GET_REVID_VERSION,
    CMD_START,
    // Capabilities
    DEV_CAPS_16BIT,
    DEV_CAPS_AX_ANALOG,
    // Limits
    FX2LAFW_REQUIRED_VERSION_MAJOR,
    KHZ,
    MAX_16BIT_SAMPLE_RATE,
    MAX_8BIT_SAMPLE_RATE,
    MAX_EMPTY_TRANSFERS,
    MAX_RENUM_DELAY_MS,
    MHZ,
    NUM_SIMUL_TRANSFERS,
    NUM_TRIGGER_STAGES,
};

pub use acquisition::{AbortHandle, Acquisition};
pub use context::DeviceContext;
pub use device::Fx2lafw;
pub use error::{Fx2lafwError, Result};
pub use profile::{find_profile, DeviceFamily, DeviceProfile, DeviceVariant, SUPPORTED_PROFILES};
pub use registry::RenumerationRegistry;
pub use stream::{AcquisitionSummary, LogicPacket, Outcome, Packet, SampleSink};
pub use structures::{ClockSource, SampleWidth, StartAcquisition, VersionInfo};
pub use transfer::{BulkTransport, Completion, PoolParams, TransferRequest, TransferStatus};
pub use trigger::{TriggerConfig, TriggerStage};
pub use usb::{AsyncBackend, AsyncTransport, RusbBackend, RusbTransport};
