//! Error types for the fx2lafw library
//!
//! This module defines the error types used throughout the library
//! for handling USB communication, protocol, configuration and
//! acquisition errors.

use thiserror::Error;

/// Result type alias for fx2lafw operations
pub type Result<T> = std::result::Result<T, Fx2lafwError>;

/// Error types for fx2lafw operations
#[derive(Error, Debug)]
pub enum Fx2lafwError {
    /// USB error from the rusb library
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// No supported device found
    #[error("No fx2lafw device found")]
    DeviceNotFound,

    /// Failed to claim interface
    #[error("Failed to claim USB interface: {0}")]
    ClaimInterface(rusb::Error),

    /// Failed to detach kernel driver
    #[error("Failed to detach kernel driver: {0}")]
    DetachKernelDriver(rusb::Error),

    /// Control transfer failed
    #[error("Control transfer failed: {0}")]
    ControlTransfer(rusb::Error),

    /// Bulk transfer could not be submitted
    #[error("Failed to submit bulk transfer: {0}")]
    SubmitTransfer(String),

    /// Device still runs its boot loader or vendor firmware
    #[error("Device has no fx2lafw firmware loaded (needs {firmware})")]
    FirmwareNotLoaded { firmware: &'static str },

    /// Reply of unexpected size
    #[error("Invalid response from device: expected {expected} bytes, got {actual}")]
    InvalidResponse { expected: usize, actual: usize },

    /// Firmware major version the driver cannot speak
    #[error("Expected firmware version {expected}.x, got {major}.{minor}")]
    FirmwareVersionMismatch { expected: u8, major: u8, minor: u8 },

    /// A firmware upload for this device family is still settling
    #[error("Device is renumerating after firmware upload, retry in {remaining_ms} ms")]
    RenumerationPending { remaining_ms: u64 },

    /// Sample rate cannot be produced by the GPIF clock dividers or exceeds the width ceiling
    #[error("Unable to sample at {samplerate} Hz with {width_bits}-bit samples")]
    UnsupportedSampleRate { samplerate: u64, width_bits: u8 },

    /// Sample rate not offered by the device
    #[error("Sample rate {0} Hz is not in the device's samplerate table")]
    SampleRateNotInTable(u64),

    /// 16-bit sampling requested on an 8-bit device
    #[error("Device does not support 16-bit sampling")]
    WideSamplingNotSupported,

    /// Capture ratio outside 0..=100
    #[error("Invalid capture ratio {0} (must be 0-100)")]
    InvalidCaptureRatio(u64),

    /// Pre-trigger history larger than the address space
    #[error("Cannot keep {samples} pre-trigger samples of {width_bits} bits in memory")]
    PreTriggerTooLarge { samples: u64, width_bits: u8 },

    /// More trigger stages than the matcher has
    #[error("Too many trigger stages: {count} (maximum {max})")]
    TooManyTriggerStages { count: usize, max: usize },

    /// Trigger stage mask wider than the sample
    #[error("Trigger stage {stage} mask 0x{mask:04x} exceeds {width_bits}-bit samples")]
    InvalidTriggerStage { stage: usize, mask: u16, width_bits: u8 },

    /// Device does not support the requested feature
    #[error("Device does not support feature: {0}")]
    FeatureNotSupported(&'static str),

    /// Acquisition is already running
    #[error("Acquisition is already running")]
    AlreadyRunning,

    /// Too many consecutive empty or failed transfers
    #[error(
        "Device stalled after {empty_transfers} empty transfers ({sent_samples} samples delivered)"
    )]
    Stalled { empty_transfers: u32, sent_samples: u64 },

    /// Device went away during acquisition
    #[error("Device disconnected ({sent_samples} samples delivered)")]
    Disconnected { sent_samples: u64 },
}

impl Fx2lafwError {
    /// Check if the caller should retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Fx2lafwError::RenumerationPending { .. })
    }

    /// Check if this error was raised while validating configuration
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Fx2lafwError::UnsupportedSampleRate { .. }
                | Fx2lafwError::SampleRateNotInTable(_)
                | Fx2lafwError::WideSamplingNotSupported
                | Fx2lafwError::InvalidCaptureRatio(_)
                | Fx2lafwError::PreTriggerTooLarge { .. }
                | Fx2lafwError::TooManyTriggerStages { .. }
                | Fx2lafwError::InvalidTriggerStage { .. }
        )
    }

    /// Check if this is a USB transport error
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Fx2lafwError::Usb(_)
                | Fx2lafwError::ClaimInterface(_)
                | Fx2lafwError::DetachKernelDriver(_)
                | Fx2lafwError::ControlTransfer(_)
                | Fx2lafwError::SubmitTransfer(_)
                | Fx2lafwError::Stalled { .. }
                | Fx2lafwError::Disconnected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_renumeration_is_retryable() {
        assert!(Fx2lafwError::RenumerationPending { remaining_ms: 10 }.is_retryable());
        assert!(!Fx2lafwError::Stalled {
            empty_transfers: 64,
            sent_samples: 0
        }
        .is_retryable());
        assert!(!Fx2lafwError::FirmwareVersionMismatch {
            expected: 1,
            major: 0,
            minor: 3
        }
        .is_retryable());
    }

    #[test]
    fn test_classification() {
        assert!(Fx2lafwError::WideSamplingNotSupported.is_configuration_error());
        assert!(!Fx2lafwError::WideSamplingNotSupported.is_transport_error());
        assert!(Fx2lafwError::Disconnected { sent_samples: 3 }.is_transport_error());
        assert!(Fx2lafwError::Usb(rusb::Error::Pipe).is_transport_error());
    }
}
