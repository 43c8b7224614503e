//! fx2lafw protocol structures
//!
//! This module contains the command and reply payloads exchanged with the
//! firmware over the control endpoint.

use crate::constants::{
    CMD_START_FLAGS_CLK_30MHZ, CMD_START_FLAGS_CLK_48MHZ, CMD_START_FLAGS_SAMPLE_16BIT,
    CMD_START_FLAGS_SAMPLE_8BIT, FX2LAFW_REQUIRED_VERSION_MAJOR, GPIF_CLOCK_30MHZ,
    GPIF_CLOCK_48MHZ, MAX_16BIT_SAMPLE_RATE, MAX_8BIT_SAMPLE_RATE, MAX_SAMPLE_DELAY,
};
use crate::error::{Fx2lafwError, Result};

/// Sample word width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleWidth {
    /// One byte per sample
    #[default]
    Bits8,
    /// Two bytes per sample, little-endian
    Bits16,
}

impl SampleWidth {
    /// Bytes per sample word
    pub fn unit_size(self) -> usize {
        match self {
            SampleWidth::Bits8 => 1,
            SampleWidth::Bits16 => 2,
        }
    }

    /// Bits per sample word
    pub fn bits(self) -> u8 {
        match self {
            SampleWidth::Bits8 => 8,
            SampleWidth::Bits16 => 16,
        }
    }

    /// Highest sample rate the GPIF can sustain at this width
    pub fn max_samplerate(self) -> u64 {
        match self {
            SampleWidth::Bits8 => MAX_8BIT_SAMPLE_RATE,
            SampleWidth::Bits16 => MAX_16BIT_SAMPLE_RATE,
        }
    }

    /// Largest value a sample word can hold
    pub fn value_mask(self) -> u16 {
        match self {
            SampleWidth::Bits8 => 0x00FF,
            SampleWidth::Bits16 => 0xFFFF,
        }
    }
}

/// GPIF clock source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    /// 30 MHz internal clock
    Internal30MHz,
    /// 48 MHz internal clock
    Internal48MHz,
}

impl ClockSource {
    /// Clock frequency in Hz
    pub fn frequency(self) -> u64 {
        match self {
            ClockSource::Internal30MHz => GPIF_CLOCK_30MHZ,
            ClockSource::Internal48MHz => GPIF_CLOCK_48MHZ,
        }
    }

    fn flag(self) -> u8 {
        match self {
            ClockSource::Internal30MHz => CMD_START_FLAGS_CLK_30MHZ,
            ClockSource::Internal48MHz => CMD_START_FLAGS_CLK_48MHZ,
        }
    }
}

/// Firmware version reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    /// Major version (API compatibility)
    pub major: u8,
    /// Minor version
    pub minor: u8,
}

impl VersionInfo {
    /// Reply size in bytes
    pub const SIZE: usize = 2;

    /// Unpack from bytes received via USB
    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() != Self::SIZE {
            return Err(Fx2lafwError::InvalidResponse {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            major: data[0],
            minor: data[1],
        })
    }

    /// Reject firmware with an incompatible major version
    ///
    /// Minor versions are compatible with each other.
    pub fn check_compatible(&self) -> Result<()> {
        if self.major != FX2LAFW_REQUIRED_VERSION_MAJOR {
            return Err(Fx2lafwError::FirmwareVersionMismatch {
                expected: FX2LAFW_REQUIRED_VERSION_MAJOR,
                major: self.major,
                minor: self.minor,
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Start acquisition command payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartAcquisition {
    /// Width and clock source flags (CMD_START_FLAGS_*)
    pub flags: u8,
    /// GPIF delay in clock ticks between samples, minus one
    pub sample_delay: u16,
}

impl StartAcquisition {
    /// Payload size in bytes
    pub const SIZE: usize = 3;

    /// Encode a start command for the given width and sample rate
    ///
    /// The 48 MHz clock is preferred when it divides the rate evenly.
    pub fn new(width: SampleWidth, samplerate: u64) -> Result<Self> {
        let unsupported = Fx2lafwError::UnsupportedSampleRate {
            samplerate,
            width_bits: width.bits(),
        };
        if samplerate == 0 || samplerate > width.max_samplerate() {
            return Err(unsupported);
        }

        let (clock, delay) = [ClockSource::Internal48MHz, ClockSource::Internal30MHz]
            .into_iter()
            .filter(|clock| clock.frequency() % samplerate == 0)
            .map(|clock| (clock, clock.frequency() / samplerate - 1))
            .find(|&(_, delay)| delay > 0 && delay <= MAX_SAMPLE_DELAY as u64)
            .ok_or(unsupported)?;

        log::debug!(
            "GPIF delay = {}, clocksource = {}MHz",
            delay,
            clock.frequency() / 1_000_000
        );

        let wide = match width {
            SampleWidth::Bits8 => CMD_START_FLAGS_SAMPLE_8BIT,
            SampleWidth::Bits16 => CMD_START_FLAGS_SAMPLE_16BIT,
        };

        Ok(Self {
            flags: clock.flag() | wide,
            sample_delay: delay as u16,
        })
    }

    /// Sample width selected by the flags
    pub fn sample_width(&self) -> SampleWidth {
        if (self.flags & CMD_START_FLAGS_SAMPLE_16BIT) != 0 {
            SampleWidth::Bits16
        } else {
            SampleWidth::Bits8
        }
    }

    /// Clock source selected by the flags
    pub fn clock_source(&self) -> ClockSource {
        if (self.flags & CMD_START_FLAGS_CLK_48MHZ) != 0 {
            ClockSource::Internal48MHz
        } else {
            ClockSource::Internal30MHz
        }
    }

    /// Sample rate produced by the clock source and delay
    pub fn samplerate(&self) -> u64 {
        self.clock_source().frequency() / (self.sample_delay as u64 + 1)
    }

    /// Recover the width and sample rate this command encodes
    pub fn decode(&self) -> (SampleWidth, u64) {
        (self.sample_width(), self.samplerate())
    }

    /// Pack into bytes for USB transfer
    pub fn pack(&self) -> [u8; Self::SIZE] {
        let [delay_h, delay_l] = self.sample_delay.to_be_bytes();
        [self.flags, delay_h, delay_l]
    }

    /// Unpack from a command payload
    pub fn unpack(data: &[u8; Self::SIZE]) -> Self {
        Self {
            flags: data[0],
            sample_delay: u16::from_be_bytes([data[1], data[2]]),
        }
    }
}

impl std::fmt::Display for StartAcquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Flags: 0x{:02x}\nDelay: {}\nRate: {} Hz",
            self.flags,
            self.sample_delay,
            self.samplerate()
        )
    }
}
