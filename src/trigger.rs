//! Software trigger matching
//!
//! The fx2lafw hardware has no trigger comparator, so the trigger point is
//! located in the incoming sample stream. Matching progress is carried across
//! payloads, so a trigger sequence may straddle transfer boundaries.

use crate::constants::NUM_TRIGGER_STAGES;
use crate::error::{Fx2lafwError, Result};
use crate::structures::SampleWidth;

/// One trigger stage
///
/// A sample matches when `(sample & mask) == (value & mask)`. A zero mask
/// always passes without consuming a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerStage {
    /// Channels this stage looks at
    pub mask: u16,
    /// Expected levels of the masked channels
    pub value: u16,
}

impl TriggerStage {
    /// Create a new trigger stage
    pub fn new(mask: u16, value: u16) -> Self {
        Self { mask, value }
    }

    /// Stage that matches any sample
    pub fn always() -> Self {
        Self::default()
    }

    /// Check if this stage is unconfigured
    pub fn is_always(&self) -> bool {
        self.mask == 0
    }

    /// Compare a sample word against this stage
    pub fn matches(&self, sample: u16) -> bool {
        (sample & self.mask) == (self.value & self.mask)
    }
}

/// Ordered trigger stages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerConfig {
    stages: Vec<TriggerStage>,
}

impl TriggerConfig {
    /// Build a trigger from up to `NUM_TRIGGER_STAGES` stages
    pub fn new(stages: &[TriggerStage]) -> Result<Self> {
        if stages.len() > NUM_TRIGGER_STAGES {
            return Err(Fx2lafwError::TooManyTriggerStages {
                count: stages.len(),
                max: NUM_TRIGGER_STAGES,
            });
        }
        Ok(Self {
            stages: stages.to_vec(),
        })
    }

    /// Configured stages
    pub fn stages(&self) -> &[TriggerStage] {
        &self.stages
    }

    /// Reject stages looking at channels the sample width does not carry
    pub fn validate(&self, width: SampleWidth) -> Result<()> {
        for (stage, s) in self.stages.iter().enumerate() {
            if (s.mask & !width.value_mask()) != 0 {
                return Err(Fx2lafwError::InvalidTriggerStage {
                    stage,
                    mask: s.mask,
                    width_bits: width.bits(),
                });
            }
        }
        Ok(())
    }
}

/// Stage-by-stage trigger matcher
#[derive(Debug, Clone)]
pub struct TriggerMatcher {
    stages: [TriggerStage; NUM_TRIGGER_STAGES],
    num_stages: usize,
    width: SampleWidth,
    cur_stage: usize,
    /// Samples examined so far
    position: u64,
    /// Stream position of the sample that completed the last stage
    fired_at: Option<u64>,
}

impl TriggerMatcher {
    /// Create a matcher for the given stages
    pub fn new(config: &TriggerConfig, width: SampleWidth) -> Self {
        let mut stages = [TriggerStage::always(); NUM_TRIGGER_STAGES];
        for (slot, stage) in stages.iter_mut().zip(config.stages()) {
            *slot = *stage;
        }
        Self {
            stages,
            num_stages: config.stages().len(),
            width,
            cur_stage: 0,
            position: 0,
            fired_at: None,
        }
    }

    /// Create a matcher that has already fired at stream position 0
    pub fn disabled(width: SampleWidth) -> Self {
        Self {
            stages: [TriggerStage::always(); NUM_TRIGGER_STAGES],
            num_stages: 0,
            width,
            cur_stage: 0,
            position: 0,
            fired_at: Some(0),
        }
    }

    /// Check if the trigger has fired
    pub fn fired(&self) -> bool {
        self.fired_at.is_some()
    }

    /// Stream position (in samples) of the trigger point
    pub fn fired_at(&self) -> Option<u64> {
        self.fired_at
    }

    /// Index of the stage currently compared
    pub fn current_stage(&self) -> usize {
        self.cur_stage
    }

    /// Skip stages that pass without looking at a sample
    ///
    /// Returns true once every stage has passed.
    fn skip_always_stages(&mut self) -> bool {
        while self.cur_stage < self.num_stages && self.stages[self.cur_stage].is_always() {
            self.cur_stage += 1;
        }
        self.cur_stage >= self.num_stages
    }

    fn step(&mut self, sample: u16) -> bool {
        if self.skip_always_stages() {
            return true;
        }
        if self.stages[self.cur_stage].matches(sample) {
            self.cur_stage += 1;
            return self.cur_stage >= self.num_stages;
        }
        if self.cur_stage > 0 {
            // Rewind and give the first stage a chance at this sample
            self.cur_stage = 0;
            if self.skip_always_stages() {
                return true;
            }
            if self.stages[self.cur_stage].matches(sample) {
                self.cur_stage += 1;
                return self.cur_stage >= self.num_stages;
            }
        }
        false
    }

    /// Scan a payload of raw sample bytes for the trigger
    ///
    /// Returns the sample index inside `payload` at which the trigger fired.
    /// Once fired, further calls return `None` without comparing anything.
    pub fn check(&mut self, payload: &[u8]) -> Option<usize> {
        if self.fired() {
            return None;
        }
        let unit = self.width.unit_size();
        for (index, word) in payload.chunks_exact(unit).enumerate() {
            let sample = match self.width {
                SampleWidth::Bits8 => word[0] as u16,
                SampleWidth::Bits16 => u16::from_le_bytes([word[0], word[1]]),
            };
            let fired = self.step(sample);
            self.position += 1;
            if fired {
                let at = self.position - 1;
                log::debug!("Trigger fired at sample {}", at);
                self.fired_at = Some(at);
                return Some(index);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(stages: &[TriggerStage]) -> TriggerMatcher {
        TriggerMatcher::new(&TriggerConfig::new(stages).unwrap(), SampleWidth::Bits8)
    }

    #[test]
    fn test_two_stage_sequence() {
        let mut m = matcher(&[TriggerStage::new(0x01, 0x01), TriggerStage::new(0x02, 0x02)]);
        assert_eq!(m.check(&[0x00, 0x01, 0x03, 0x05]), Some(2));
        assert!(m.fired());
        assert_eq!(m.fired_at(), Some(2));
    }

    #[test]
    fn test_always_stages_fire_at_first_sample() {
        let mut m = matcher(&[TriggerStage::always(); 4]);
        assert_eq!(m.check(&[0xAA, 0x55]), Some(0));

        let mut m = matcher(&[]);
        assert_eq!(m.check(&[0x12]), Some(0));
    }

    #[test]
    fn test_empty_payload_does_not_fire() {
        let mut m = matcher(&[TriggerStage::always()]);
        assert_eq!(m.check(&[]), None);
        assert!(!m.fired());
    }

    #[test]
    fn test_unused_stage_is_skipped() {
        let mut m = matcher(&[
            TriggerStage::new(0x01, 0x01),
            TriggerStage::always(),
            TriggerStage::new(0x80, 0x00),
        ]);
        assert_eq!(m.check(&[0x81, 0x81, 0x01]), Some(2));
    }

    #[test]
    fn test_match_spans_payloads() {
        let mut m = matcher(&[TriggerStage::new(0xFF, 0x10), TriggerStage::new(0xFF, 0x20)]);
        assert_eq!(m.check(&[0x00, 0x00, 0x10]), None);
        assert_eq!(m.current_stage(), 1);
        assert_eq!(m.check(&[0x20, 0x00]), Some(0));
        assert_eq!(m.fired_at(), Some(3));
    }

    #[test]
    fn test_mismatch_rewinds_and_retries_sample() {
        let mut m = matcher(&[TriggerStage::new(0xFF, 0x01), TriggerStage::new(0xFF, 0x02)]);
        // 0x01, 0x01 restarts the sequence on the second sample
        assert_eq!(m.check(&[0x01, 0x01, 0x02]), Some(2));
    }

    #[test]
    fn test_fired_matcher_is_idle() {
        let mut m = matcher(&[TriggerStage::new(0x01, 0x01)]);
        assert_eq!(m.check(&[0x01]), Some(0));
        assert_eq!(m.check(&[0x01, 0x01]), None);
        assert_eq!(m.fired_at(), Some(0));
    }

    #[test]
    fn test_disabled_matcher() {
        let mut m = TriggerMatcher::disabled(SampleWidth::Bits16);
        assert!(m.fired());
        assert_eq!(m.fired_at(), Some(0));
        assert_eq!(m.check(&[0, 0]), None);
    }

    #[test]
    fn test_wide_samples() {
        let config = TriggerConfig::new(&[TriggerStage::new(0x8000, 0x8000)]).unwrap();
        let mut m = TriggerMatcher::new(&config, SampleWidth::Bits16);
        assert_eq!(m.check(&[0xFF, 0x7F, 0x00, 0x80]), Some(1));
    }

    #[test]
    fn test_config_validation() {
        assert!(matches!(
            TriggerConfig::new(&[TriggerStage::always(); 5]),
            Err(Fx2lafwError::TooManyTriggerStages { count: 5, max: 4 })
        ));

        let wide = TriggerConfig::new(&[TriggerStage::new(0x0100, 0)]).unwrap();
        assert!(wide.validate(SampleWidth::Bits16).is_ok());
        assert!(matches!(
            wide.validate(SampleWidth::Bits8),
            Err(Fx2lafwError::InvalidTriggerStage { stage: 0, .. })
        ));
    }
}
