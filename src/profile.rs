//! Supported hardware profiles
//!
//! Static descriptions of every fx2lafw-compatible device this driver knows,
//! including the DreamSourceLab variants that share the FX2 front end.

use crate::constants::{
    DEV_CAPS_16BIT, DEV_CAPS_AX_ANALOG, DSCOPE_FPGA_FIRMWARE, DSLOGIC_DATA_ENDPOINT,
    DSLOGIC_FPGA_FIRMWARE, DSLOGIC_PRO_FPGA_FIRMWARE, FX2LAFW_DATA_ENDPOINT, KHZ, MHZ,
};

/// Hardware variant
///
/// Each variant carries only the data meaningful to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceVariant {
    /// Plain FX2 running the fx2lafw firmware
    Fx2lafw,
    /// DreamSourceLab DSLogic
    DsLogic { fpga_firmware: &'static str },
    /// DreamSourceLab DSCope
    DsCope { fpga_firmware: &'static str },
    /// DreamSourceLab DSLogic Pro
    DsLogicPro { fpga_firmware: &'static str },
}

/// Device family used to key the renumeration guard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFamily {
    Fx2lafw,
    DreamSourceLab,
}

impl DeviceVariant {
    /// Get the device family
    pub fn family(&self) -> DeviceFamily {
        match self {
            DeviceVariant::Fx2lafw => DeviceFamily::Fx2lafw,
            _ => DeviceFamily::DreamSourceLab,
        }
    }

    /// FPGA bitstream the variant needs after the FX2 firmware, if any
    pub fn fpga_firmware(&self) -> Option<&'static str> {
        match *self {
            DeviceVariant::Fx2lafw => None,
            DeviceVariant::DsLogic { fpga_firmware }
            | DeviceVariant::DsCope { fpga_firmware }
            | DeviceVariant::DsLogicPro { fpga_firmware } => Some(fpga_firmware),
        }
    }

    /// Bulk IN endpoint number the samples arrive on
    pub fn data_endpoint(&self) -> u8 {
        match self {
            DeviceVariant::Fx2lafw => FX2LAFW_DATA_ENDPOINT,
            _ => DSLOGIC_DATA_ENDPOINT,
        }
    }

    /// Whether acquisition is started with the GPIF `CMD_START` request
    pub fn uses_gpif_start(&self) -> bool {
        matches!(self, DeviceVariant::Fx2lafw)
    }

    /// Supported sample rates, slowest first
    pub fn samplerates(&self) -> &'static [u64] {
        match self {
            DeviceVariant::Fx2lafw => FX2LAFW_SAMPLERATES,
            _ => DSLOGIC_SAMPLERATES,
        }
    }
}

/// Static description of a supported device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    /// USB vendor ID
    pub vid: u16,
    /// USB product ID
    pub pid: u16,
    /// Vendor name
    pub vendor: &'static str,
    /// Model name
    pub model: &'static str,
    /// Model version
    pub model_version: Option<&'static str>,
    /// FX2 firmware image
    pub firmware: &'static str,
    /// Capability bits (DEV_CAPS_*)
    pub dev_caps: u32,
    /// Manufacturer string reported once the firmware is running
    pub usb_manufacturer: Option<&'static str>,
    /// Product string reported once the firmware is running
    pub usb_product: Option<&'static str>,
    /// Hardware variant
    pub variant: DeviceVariant,
}

impl DeviceProfile {
    /// Check if 16-bit sampling is supported
    pub fn supports_16bit(&self) -> bool {
        (self.dev_caps & DEV_CAPS_16BIT) != 0
    }

    /// Check if the extra analog channel is supported
    pub fn supports_analog(&self) -> bool {
        (self.dev_caps & DEV_CAPS_AX_ANALOG) != 0
    }

    /// Number of logic channels
    pub fn logic_channel_count(&self) -> usize {
        if self.supports_16bit() {
            16
        } else {
            8
        }
    }

    /// Number of analog channels
    pub fn analog_channel_count(&self) -> usize {
        if self.supports_analog() {
            1
        } else {
            0
        }
    }

    /// Check whether a USB device matches this profile
    ///
    /// Profiles with USB strings only match devices already running the firmware.
    pub fn matches(&self, vid: u16, pid: u16, manufacturer: &str, product: &str) -> bool {
        self.vid == vid
            && self.pid == pid
            && self.usb_manufacturer.map_or(true, |m| m == manufacturer)
            && self.usb_product.map_or(true, |p| p == product)
    }

    /// Check if the USB strings show the FX2 firmware is running
    pub fn has_firmware(&self, manufacturer: &str, product: &str) -> bool {
        self.firmware_strings()
            .iter()
            .any(|&(m, p)| m == manufacturer && p == product)
    }

    /// USB strings the device reports once its FX2 firmware is loaded
    pub fn firmware_strings(&self) -> &'static [(&'static str, &'static str)] {
        match self.variant {
            DeviceVariant::Fx2lafw => &[("sigrok", "fx2lafw")],
            _ => &[("DreamSourceLab", "DSLogic"), ("DreamSourceLab", "DSCope")],
        }
    }
}

impl std::fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} ({:04x}:{:04x})",
            self.vendor, self.model, self.vid, self.pid
        )
    }
}

/// Sample rates offered by fx2lafw firmware
pub const FX2LAFW_SAMPLERATES: &[u64] = &[
    20 * KHZ,
    25 * KHZ,
    50 * KHZ,
    100 * KHZ,
    200 * KHZ,
    250 * KHZ,
    500 * KHZ,
    MHZ,
    2 * MHZ,
    3 * MHZ,
    4 * MHZ,
    6 * MHZ,
    8 * MHZ,
    12 * MHZ,
    16 * MHZ,
    24 * MHZ,
];

/// Sample rates offered by DreamSourceLab hardware
pub const DSLOGIC_SAMPLERATES: &[u64] = &[
    10 * KHZ,
    20 * KHZ,
    50 * KHZ,
    100 * KHZ,
    200 * KHZ,
    500 * KHZ,
    MHZ,
    2 * MHZ,
    5 * MHZ,
    10 * MHZ,
    20 * MHZ,
    25 * MHZ,
    50 * MHZ,
    100 * MHZ,
    200 * MHZ,
    400 * MHZ,
];

const fn fx2(
    vid: u16,
    pid: u16,
    vendor: &'static str,
    model: &'static str,
    firmware: &'static str,
    dev_caps: u32,
) -> DeviceProfile {
    DeviceProfile {
        vid,
        pid,
        vendor,
        model,
        model_version: None,
        firmware,
        dev_caps,
        usb_manufacturer: None,
        usb_product: None,
        variant: DeviceVariant::Fx2lafw,
    }
}

const fn dsl(
    pid: u16,
    model: &'static str,
    firmware: &'static str,
    usb_strings: Option<(&'static str, &'static str)>,
    variant: DeviceVariant,
) -> DeviceProfile {
    let (usb_manufacturer, usb_product) = match usb_strings {
        Some((m, p)) => (Some(m), Some(p)),
        None => (None, None),
    };
    DeviceProfile {
        vid: 0x2a0e,
        pid,
        vendor: "DreamSourceLab",
        model,
        model_version: None,
        firmware,
        dev_caps: DEV_CAPS_16BIT,
        usb_manufacturer,
        usb_product,
        variant,
    }
}

const DSLOGIC: DeviceVariant = DeviceVariant::DsLogic {
    fpga_firmware: DSLOGIC_FPGA_FIRMWARE,
};
const DSCOPE: DeviceVariant = DeviceVariant::DsCope {
    fpga_firmware: DSCOPE_FPGA_FIRMWARE,
};
const DSLOGIC_PRO: DeviceVariant = DeviceVariant::DsLogicPro {
    fpga_firmware: DSLOGIC_PRO_FPGA_FIRMWARE,
};

/// Every supported device
///
/// DreamSourceLab devices appear twice: before and after the FX2 firmware upload.
pub static SUPPORTED_PROFILES: &[DeviceProfile] = &[
    // CWAV USBee AX, EE Electronics ESLA201A, ARMFLY AX-Pro
    fx2(0x08a9, 0x0014, "CWAV", "USBee AX", "fx2lafw-cwav-usbeeax.fw", DEV_CAPS_AX_ANALOG),
    // CWAV USBee DX, XZL-Studio DX
    fx2(0x08a9, 0x0015, "CWAV", "USBee DX", "fx2lafw-cwav-usbeedx.fw", DEV_CAPS_16BIT),
    fx2(0x08a9, 0x0009, "CWAV", "USBee SX", "fx2lafw-cwav-usbeesx.fw", 0),
    dsl(0x0001, "DSLogic", "dreamsourcelab-dslogic-fx2.fw", None, DSLOGIC),
    dsl(
        0x0001,
        "DSLogic",
        "dreamsourcelab-dslogic-fx2.fw",
        Some(("DreamSourceLab", "DSLogic")),
        DSLOGIC,
    ),
    dsl(0x0002, "DSCope", "dreamsourcelab-dscope-fx2.fw", None, DSCOPE),
    dsl(
        0x0002,
        "DSCope",
        "dreamsourcelab-dscope-fx2.fw",
        Some(("DreamSourceLab", "DSCope")),
        DSCOPE,
    ),
    dsl(0x0003, "DSLogic Pro", "dreamsourcelab-dslogic-pro-fx2.fw", None, DSLOGIC_PRO),
    dsl(
        0x0003,
        "DSLogic Pro",
        "dreamsourcelab-dslogic-pro-fx2.fw",
        Some(("DreamSourceLab", "DSLogic")),
        DSLOGIC_PRO,
    ),
    // Saleae Logic, EE Electronics ESLA100, Robomotic MiniLogic / BugLogic 3
    fx2(0x0925, 0x3881, "Saleae", "Logic", "fx2lafw-saleae-logic.fw", 0),
    // Cypress FX2 without EEPROM (Lcsoft Mini Board, Braintechnology USB Interface V2.x)
    fx2(0x04b4, 0x8613, "Cypress", "FX2", "fx2lafw-cypress-fx2.fw", DEV_CAPS_16BIT),
    fx2(
        0x16d0,
        0x0498,
        "Braintechnology",
        "USB-LPS",
        "fx2lafw-braintechnology-usb-lps.fw",
        DEV_CAPS_16BIT,
    ),
    fx2(0x1d50, 0x608c, "sigrok", "FX2 LA (8ch)", "fx2lafw-sigrok-fx2-8ch.fw", 0),
    fx2(
        0x1d50,
        0x608d,
        "sigrok",
        "FX2 LA (16ch)",
        "fx2lafw-sigrok-fx2-16ch.fw",
        DEV_CAPS_16BIT,
    ),
];

/// Find the profile matching a USB device
///
/// A profile that also matches the USB strings wins over one that matches
/// only the IDs.
pub fn find_profile(
    vid: u16,
    pid: u16,
    manufacturer: &str,
    product: &str,
) -> Option<&'static DeviceProfile> {
    let mut candidates = SUPPORTED_PROFILES
        .iter()
        .filter(|p| p.matches(vid, pid, manufacturer, product));
    let first = candidates.next()?;
    Some(
        candidates
            .find(|p| p.usb_product.is_some())
            .unwrap_or(first),
    )
}

/// Check if a vendor/product pair belongs to any supported device
pub fn is_supported_id(vid: u16, pid: u16) -> bool {
    SUPPORTED_PROFILES
        .iter()
        .any(|p| p.vid == vid && p.pid == pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_plain_fx2lafw() {
        let p = find_profile(0x0925, 0x3881, "", "").unwrap();
        assert_eq!(p.model, "Logic");
        assert!(!p.supports_16bit());
        assert_eq!(p.logic_channel_count(), 8);
        assert_eq!(p.variant.data_endpoint(), 2);
        assert!(p.variant.uses_gpif_start());
    }

    #[test]
    fn test_usbee_ax_has_analog() {
        let p = find_profile(0x08a9, 0x0014, "", "").unwrap();
        assert!(p.supports_analog());
        assert_eq!(p.analog_channel_count(), 1);
    }

    #[test]
    fn test_dslogic_before_and_after_firmware() {
        let before = find_profile(0x2a0e, 0x0003, "", "").unwrap();
        assert_eq!(before.usb_manufacturer, None);

        let after = SUPPORTED_PROFILES
            .iter()
            .find(|p| p.pid == 0x0003 && p.usb_product.is_some())
            .unwrap();
        assert!(after.matches(0x2a0e, 0x0003, "DreamSourceLab", "DSLogic"));
        assert!(!after.matches(0x2a0e, 0x0003, "DreamSourceLab", "DSCope"));
        assert_eq!(
            after.variant.fpga_firmware(),
            Some(DSLOGIC_PRO_FPGA_FIRMWARE)
        );
        assert_eq!(after.variant.family(), DeviceFamily::DreamSourceLab);
        assert_eq!(after.variant.data_endpoint(), 6);
    }

    #[test]
    fn test_string_match_preferred() {
        let p = find_profile(0x2a0e, 0x0001, "DreamSourceLab", "DSLogic").unwrap();
        assert_eq!(p.usb_product, Some("DSLogic"));
        assert!(p.has_firmware("DreamSourceLab", "DSLogic"));

        let saleae = find_profile(0x0925, 0x3881, "sigrok", "fx2lafw").unwrap();
        assert!(saleae.has_firmware("sigrok", "fx2lafw"));
        assert!(!saleae.has_firmware("Saleae", "Logic"));
    }

    #[test]
    fn test_samplerate_tables_sorted() {
        for table in [FX2LAFW_SAMPLERATES, DSLOGIC_SAMPLERATES] {
            assert!(table.windows(2).all(|w| w[0] < w[1]));
        }
        assert_eq!(*FX2LAFW_SAMPLERATES.last().unwrap(), 24 * MHZ);
    }

    #[test]
    fn test_unknown_device() {
        assert!(find_profile(0x1234, 0x5678, "", "").is_none());
        assert!(!is_supported_id(0x1234, 0x5678));
        assert!(is_supported_id(0x1d50, 0x608d));
    }
}
