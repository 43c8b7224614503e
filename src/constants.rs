//! fx2lafw protocol constants
//!
//! This module contains the constants used by the fx2lafw firmware protocol,
//! including command codes, start flags, sample-rate ceilings, capability bits
//! and the transfer pool limits.

// ============================================================================
// USB Layout
// ============================================================================

/// USB interface claimed for acquisition
pub const USB_INTERFACE: u8 = 0;
/// USB configuration selected by the firmware
pub const USB_CONFIGURATION: u8 = 1;

/// Bulk IN data endpoint for fx2lafw firmware
pub const FX2LAFW_DATA_ENDPOINT: u8 = 2;
/// Bulk IN data endpoint for DreamSourceLab firmware
pub const DSLOGIC_DATA_ENDPOINT: u8 = 6;
/// Direction bit for IN endpoints
pub const USB_ENDPOINT_IN: u8 = 0x80;

/// bmRequestType: vendor, host-to-device
pub const VENDOR_REQUEST_OUT: u8 = 0x40;
/// bmRequestType: vendor, device-to-host
pub const VENDOR_REQUEST_IN: u8 = 0xC0;

/// Timeout for control transfers (milliseconds)
pub const USB_TIMEOUT_MS: u64 = 100;

// ============================================================================
// Protocol Commands
// ============================================================================

/// Read firmware version (2-byte reply: major, minor)
pub const CMD_GET_FW_VERSION: u8 = 0xB0;
/// Start acquisition (3-byte payload: flags, delay high, delay low)
pub const CMD_START: u8 = 0xB1;
/// Read the FX2 silicon revision (1-byte reply)
pub const CMD_GET_REVID_VERSION: u8 = 0xB2;

// ============================================================================
// Start Flags
// ============================================================================

/// Bit position of the sample width flag
pub const CMD_START_FLAGS_WIDE_POS: u8 = 5;
/// Bit position of the clock source flag
pub const CMD_START_FLAGS_CLK_SRC_POS: u8 = 6;

/// 8-bit samples
pub const CMD_START_FLAGS_SAMPLE_8BIT: u8 = 0 << CMD_START_FLAGS_WIDE_POS;
/// 16-bit samples
pub const CMD_START_FLAGS_SAMPLE_16BIT: u8 = 1 << CMD_START_FLAGS_WIDE_POS;

/// 30 MHz internal GPIF clock
pub const CMD_START_FLAGS_CLK_30MHZ: u8 = 0 << CMD_START_FLAGS_CLK_SRC_POS;
/// 48 MHz internal GPIF clock
pub const CMD_START_FLAGS_CLK_48MHZ: u8 = 1 << CMD_START_FLAGS_CLK_SRC_POS;

// ============================================================================
// Firmware
// ============================================================================

/// Firmware major version this driver speaks
pub const FX2LAFW_REQUIRED_VERSION_MAJOR: u8 = 1;

/// Wait this long after a firmware upload before opening a device of the same family
pub const MAX_RENUM_DELAY_MS: u64 = 3000;

/// FPGA bitstream for DSLogic
pub const DSLOGIC_FPGA_FIRMWARE: &str = "dreamsourcelab-dslogic-fpga.fw";
/// FPGA bitstream for DSCope
pub const DSCOPE_FPGA_FIRMWARE: &str = "dreamsourcelab-dscope-fpga.fw";
/// FPGA bitstream for DSLogic Pro
pub const DSLOGIC_PRO_FPGA_FIRMWARE: &str = "dreamsourcelab-dslogic-pro-fpga.fw";

// ============================================================================
// Sampling
// ============================================================================

/// Hz per kHz
pub const KHZ: u64 = 1_000;
/// Hz per MHz
pub const MHZ: u64 = 1_000_000;

/// Highest sample rate with 8-bit samples
pub const MAX_8BIT_SAMPLE_RATE: u64 = 24 * MHZ;
/// Highest sample rate with 16-bit samples
pub const MAX_16BIT_SAMPLE_RATE: u64 = 12 * MHZ;

/// GPIF clock at 30 MHz
pub const GPIF_CLOCK_30MHZ: u64 = 30 * MHZ;
/// GPIF clock at 48 MHz
pub const GPIF_CLOCK_48MHZ: u64 = 48 * MHZ;

/// 6 delay states of up to 256 clock ticks
pub const MAX_SAMPLE_DELAY: u32 = 6 * 256;

/// Number of soft trigger stages
pub const NUM_TRIGGER_STAGES: usize = 4;

// ============================================================================
// Capabilities (bit-mapped in DeviceProfile::dev_caps)
// ============================================================================

/// Bit position: 16-bit sampling supported
pub const DEV_CAPS_16BIT_POS: u32 = 0;
/// Bit position: extra analog channel supported
pub const DEV_CAPS_AX_ANALOG_POS: u32 = 1;

/// 16-bit sampling supported
pub const DEV_CAPS_16BIT: u32 = 1 << DEV_CAPS_16BIT_POS;
/// Extra analog channel supported (USBee AX)
pub const DEV_CAPS_AX_ANALOG: u32 = 1 << DEV_CAPS_AX_ANALOG_POS;

// ============================================================================
// Transfer Pool
// ============================================================================

/// Upper bound on concurrently outstanding bulk transfers
pub const NUM_SIMUL_TRANSFERS: usize = 32;
/// Consecutive empty or failed completions tolerated before declaring a stall
pub const MAX_EMPTY_TRANSFERS: u32 = (NUM_SIMUL_TRANSFERS as u32) * 2;

/// Bulk buffers are a multiple of the high-speed max packet size
pub const TRANSFER_BUFFER_ALIGN: usize = 512;
/// Ceiling for a single transfer buffer
pub const MAX_BUFFER_SIZE: usize = 256 * 1024;
/// Each buffer holds this much capture time
pub const TRANSFER_BUFFER_MS: u64 = 10;
/// The whole pool holds this much capture time
pub const TRANSFER_POOL_MS: u64 = 500;
/// Lower bound for the per-transfer timeout
pub const MIN_TRANSFER_TIMEOUT_MS: u64 = 100;

/// Get a human-readable chip name for a REVID reply
pub fn revid_name(revid: u8) -> &'static str {
    if revid == 1 {
        "CY7C68013A (FX2LP)"
    } else {
        "CY7C68013 (FX2)"
    }
}
