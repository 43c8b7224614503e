//! Per-device capture configuration
//!
//! Settings are validated as they are set and never clamped; `validate()`
//! checks the whole combination again before a capture starts.

use crate::error::{Fx2lafwError, Result};
use crate::profile::DeviceProfile;
use crate::structures::{SampleWidth, StartAcquisition};
use crate::trigger::{TriggerConfig, TriggerMatcher};

/// Capture configuration of one opened device
#[derive(Debug, Clone)]
pub struct DeviceContext {
    profile: &'static DeviceProfile,
    cur_samplerate: u64,
    limit_samples: Option<u64>,
    capture_ratio: u64,
    sample_width: SampleWidth,
    trigger: Option<TriggerConfig>,
}

impl DeviceContext {
    /// Create a context with default settings for a profile
    ///
    /// The slowest sample rate is selected. Analog-capable devices interleave
    /// logic and analog bytes, so they start in 16-bit mode.
    pub fn new(profile: &'static DeviceProfile) -> Self {
        let sample_width = if profile.supports_analog() {
            SampleWidth::Bits16
        } else {
            SampleWidth::Bits8
        };
        Self {
            profile,
            cur_samplerate: profile.variant.samplerates()[0],
            limit_samples: None,
            capture_ratio: 0,
            sample_width,
            trigger: None,
        }
    }

    /// Device profile
    pub fn profile(&self) -> &'static DeviceProfile {
        self.profile
    }

    /// Sample rates the device offers
    pub fn samplerates(&self) -> &'static [u64] {
        self.profile.variant.samplerates()
    }

    /// Selected sample rate in Hz
    pub fn samplerate(&self) -> u64 {
        self.cur_samplerate
    }

    /// Sample limit, `None` for continuous capture
    pub fn limit_samples(&self) -> Option<u64> {
        self.limit_samples
    }

    /// Percentage of the limit captured before the trigger
    pub fn capture_ratio(&self) -> u64 {
        self.capture_ratio
    }

    /// Sample width
    pub fn sample_width(&self) -> SampleWidth {
        self.sample_width
    }

    /// Trigger configuration, `None` when the trigger is disabled
    pub fn trigger(&self) -> Option<&TriggerConfig> {
        self.trigger.as_ref()
    }

    /// Check if a trigger is configured
    pub fn trigger_enabled(&self) -> bool {
        self.trigger.is_some()
    }

    fn check_samplerate(&self, samplerate: u64, width: SampleWidth) -> Result<()> {
        if !self.samplerates().contains(&samplerate) {
            return Err(Fx2lafwError::SampleRateNotInTable(samplerate));
        }
        if self.profile.variant.uses_gpif_start() && samplerate > width.max_samplerate() {
            return Err(Fx2lafwError::UnsupportedSampleRate {
                samplerate,
                width_bits: width.bits(),
            });
        }
        Ok(())
    }

    /// Select a sample rate from the device's table
    pub fn set_samplerate(&mut self, samplerate: u64) -> Result<()> {
        self.check_samplerate(samplerate, self.sample_width)?;
        self.cur_samplerate = samplerate;
        Ok(())
    }

    /// Select the sample width
    ///
    /// 16-bit needs the capability bit; 8-bit is refused on analog devices
    /// whose words always carry the analog byte.
    pub fn set_sample_width(&mut self, width: SampleWidth) -> Result<()> {
        match width {
            SampleWidth::Bits16
                if !self.profile.supports_16bit() && !self.profile.supports_analog() =>
            {
                return Err(Fx2lafwError::WideSamplingNotSupported)
            }
            SampleWidth::Bits8 if self.profile.supports_analog() => {
                return Err(Fx2lafwError::FeatureNotSupported(
                    "8-bit sampling on analog-capable devices",
                ))
            }
            _ => {}
        }
        self.check_samplerate(self.cur_samplerate, width)?;
        if let Some(trigger) = &self.trigger {
            trigger.validate(width)?;
        }
        self.sample_width = width;
        Ok(())
    }

    /// Set the sample limit, `None` for continuous capture
    pub fn set_limit_samples(&mut self, limit: Option<u64>) {
        self.limit_samples = limit.filter(|&l| l > 0);
    }

    /// Set the percentage of samples captured before the trigger
    pub fn set_capture_ratio(&mut self, ratio: u64) -> Result<()> {
        if ratio > 100 {
            return Err(Fx2lafwError::InvalidCaptureRatio(ratio));
        }
        self.capture_ratio = ratio;
        Ok(())
    }

    /// Set or clear the trigger
    pub fn set_trigger(&mut self, trigger: Option<TriggerConfig>) -> Result<()> {
        if let Some(trigger) = &trigger {
            trigger.validate(self.sample_width)?;
        }
        self.trigger = trigger;
        Ok(())
    }

    /// Re-check the whole configuration
    pub fn validate(&self) -> Result<()> {
        self.check_samplerate(self.cur_samplerate, self.sample_width)?;
        if self.capture_ratio > 100 {
            return Err(Fx2lafwError::InvalidCaptureRatio(self.capture_ratio));
        }
        if let Some(trigger) = &self.trigger {
            trigger.validate(self.sample_width)?;
        }
        let samples = self.pre_trigger_samples();
        let bytes = samples
            .checked_mul(self.sample_width.unit_size() as u64)
            .and_then(|bytes| usize::try_from(bytes).ok());
        if bytes.is_none() {
            return Err(Fx2lafwError::PreTriggerTooLarge {
                samples,
                width_bits: self.sample_width.bits(),
            });
        }
        Ok(())
    }

    /// Encode the start command for the current settings
    pub fn start_command(&self) -> Result<StartAcquisition> {
        if !self.profile.variant.uses_gpif_start() {
            return Err(Fx2lafwError::FeatureNotSupported(
                "GPIF start on FPGA-based devices",
            ));
        }
        self.validate()?;
        StartAcquisition::new(self.sample_width, self.cur_samplerate)
    }

    /// Samples kept from before the trigger point
    pub fn pre_trigger_samples(&self) -> u64 {
        match (self.trigger_enabled(), self.limit_samples) {
            // At most `limit`, since the ratio never exceeds 100
            (true, Some(limit)) => (self.capture_ratio as u128 * limit as u128 / 100) as u64,
            _ => 0,
        }
    }

    /// Create a trigger matcher for a new capture
    pub fn trigger_matcher(&self) -> TriggerMatcher {
        match &self.trigger {
            Some(config) => TriggerMatcher::new(config, self.sample_width),
            None => TriggerMatcher::disabled(self.sample_width),
        }
    }
}
