//! Sample stream processing
//!
//! Turns completed transfer payloads into sample packets for a [`SampleSink`],
//! applying the trigger position, the pre-trigger capture ratio and the
//! sample limit.

use std::collections::VecDeque;

use crate::error::Fx2lafwError;
use crate::structures::SampleWidth;
use crate::trigger::TriggerMatcher;

/// Logic samples
#[derive(Debug, Clone, Copy)]
pub struct LogicPacket<'a> {
    /// Bytes per sample word
    pub unit_size: usize,
    /// Raw sample words, little-endian
    pub data: &'a [u8],
}

impl<'a> LogicPacket<'a> {
    /// Number of sample words
    pub fn len(&self) -> usize {
        self.data.len() / self.unit_size
    }

    /// Check if the packet holds no samples
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over the sample words
    pub fn samples(&self) -> impl Iterator<Item = u16> + 'a {
        let unit_size = self.unit_size;
        let data: &'a [u8] = self.data;
        data.chunks_exact(unit_size).map(move |w| {
            if unit_size == 1 {
                w[0] as u16
            } else {
                u16::from_le_bytes([w[0], w[1]])
            }
        })
    }
}

/// Why an acquisition ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The sample limit was reached
    LimitReached,
    /// The user cancelled
    Cancelled,
    /// The device kept returning empty or failed transfers
    Stalled,
    /// The device went away
    Disconnected,
    /// A transfer could not be submitted or a command failed
    Failed,
}

impl Outcome {
    /// Check if this outcome is a fault rather than a normal end
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Outcome::Stalled | Outcome::Disconnected | Outcome::Failed
        )
    }
}

/// Final acquisition report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionSummary {
    /// Samples delivered to the sink, including pre-trigger samples
    pub sent_samples: u64,
    /// Whether the trigger fired (always true without a trigger)
    pub trigger_fired: bool,
    /// Why the acquisition ended
    pub outcome: Outcome,
}

/// Packets delivered to a sink
#[derive(Debug)]
pub enum Packet<'a> {
    /// Acquisition is starting
    Header { samplerate: u64, unit_size: usize },
    /// Logic samples
    Logic(LogicPacket<'a>),
    /// Analog samples of the extra channel, in ADC steps around mid-scale
    Analog(&'a [f32]),
    /// The trigger point lies between the previous and the next logic packet
    Trigger,
    /// A fatal error ended the acquisition
    Error(&'a Fx2lafwError),
    /// Acquisition finished; sent exactly once
    End(AcquisitionSummary),
}

/// Consumer of acquired samples
///
/// Called from the acquisition dispatch loop; implementations must not block.
pub trait SampleSink {
    /// Receive a packet
    fn send(&mut self, packet: Packet<'_>);
}

impl<F> SampleSink for F
where
    F: FnMut(Packet<'_>),
{
    fn send(&mut self, packet: Packet<'_>) {
        self(packet)
    }
}

/// Whether more samples are wanted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Keep the transfers coming
    Continue,
    /// The sample limit was reached
    LimitReached,
}

/// Reinterprets payload bytes as samples and forwards them to a sink
#[derive(Debug)]
pub struct SampleStreamProcessor {
    width: SampleWidth,
    limit_samples: Option<u64>,
    sent_samples: u64,
    analog: bool,
    /// Raw bytes of the most recent pre-trigger samples
    pre_trigger: VecDeque<u8>,
    pre_trigger_capacity: usize,
    logic_buffer: Vec<u8>,
    analog_buffer: Vec<f32>,
    done: bool,
}

impl SampleStreamProcessor {
    /// Create a processor
    ///
    /// `pre_trigger_samples` samples preceding the trigger point are kept and
    /// delivered when the trigger fires. With `analog`, each 16-bit word is a
    /// (logic, analog) byte pair.
    pub fn new(
        width: SampleWidth,
        limit_samples: Option<u64>,
        pre_trigger_samples: u64,
        analog: bool,
    ) -> Self {
        // Grows with the data actually seen before the trigger
        let pre_trigger_capacity = usize::try_from(pre_trigger_samples)
            .unwrap_or(usize::MAX)
            .saturating_mul(width.unit_size());
        Self {
            width,
            limit_samples,
            sent_samples: 0,
            analog,
            pre_trigger: VecDeque::new(),
            pre_trigger_capacity,
            logic_buffer: Vec::new(),
            analog_buffer: Vec::new(),
            done: false,
        }
    }

    /// Samples delivered so far
    pub fn sent_samples(&self) -> u64 {
        self.sent_samples
    }

    /// Check if the sample limit has been reached
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Bytes per sample word
    pub fn unit_size(&self) -> usize {
        self.width.unit_size()
    }

    fn remaining(&self) -> u64 {
        match self.limit_samples {
            Some(limit) => limit.saturating_sub(self.sent_samples),
            None => u64::MAX,
        }
    }

    /// Process one completed transfer payload
    pub fn process(
        &mut self,
        payload: &[u8],
        matcher: &mut TriggerMatcher,
        sink: &mut dyn SampleSink,
    ) -> StreamState {
        if self.done {
            return StreamState::LimitReached;
        }

        let unit = self.unit_size();
        let whole = payload.len() - payload.len() % unit;
        if whole != payload.len() {
            log::warn!(
                "Ignoring {} trailing byte(s) of a partial sample word",
                payload.len() - whole
            );
        }
        let payload = &payload[..whole];

        let post_trigger = if matcher.fired() {
            payload
        } else {
            match matcher.check(payload) {
                Some(offset) => {
                    let (before, after) = payload.split_at(offset * unit);
                    self.retain_pre_trigger(before);
                    if self.flush_pre_trigger(sink) == StreamState::LimitReached {
                        return StreamState::LimitReached;
                    }
                    sink.send(Packet::Trigger);
                    after
                }
                None => {
                    self.retain_pre_trigger(payload);
                    return StreamState::Continue;
                }
            }
        };

        self.forward(post_trigger, sink)
    }

    fn forward(&mut self, data: &[u8], sink: &mut dyn SampleSink) -> StreamState {
        let unit = self.unit_size();
        let available = (data.len() / unit) as u64;
        let count = available.min(self.remaining());
        if count > 0 {
            self.emit(&data[..count as usize * unit], sink);
            self.sent_samples += count;
        }
        if self.remaining() == 0 {
            self.done = true;
            return StreamState::LimitReached;
        }
        StreamState::Continue
    }

    fn retain_pre_trigger(&mut self, data: &[u8]) {
        if self.pre_trigger_capacity == 0 {
            return;
        }
        let data = if data.len() > self.pre_trigger_capacity {
            &data[data.len() - self.pre_trigger_capacity..]
        } else {
            data
        };
        let overflow = self
            .pre_trigger
            .len()
            .saturating_add(data.len())
            .saturating_sub(self.pre_trigger_capacity);
        self.pre_trigger.drain(..overflow);
        self.pre_trigger.extend(data);
    }

    fn flush_pre_trigger(&mut self, sink: &mut dyn SampleSink) -> StreamState {
        if self.pre_trigger.is_empty() {
            return StreamState::Continue;
        }
        let mut retained = std::mem::take(&mut self.pre_trigger);
        log::debug!(
            "Sending {} pre-trigger samples",
            retained.len() / self.unit_size()
        );
        self.forward(retained.make_contiguous(), sink)
    }

    fn emit(&mut self, data: &[u8], sink: &mut dyn SampleSink) {
        if !self.analog {
            sink.send(Packet::Logic(LogicPacket {
                unit_size: self.unit_size(),
                data,
            }));
            return;
        }

        self.logic_buffer.clear();
        self.analog_buffer.clear();
        for pair in data.chunks_exact(2) {
            self.logic_buffer.push(pair[0]);
            self.analog_buffer.push(pair[1] as f32 - 128.0);
        }
        sink.send(Packet::Logic(LogicPacket {
            unit_size: 1,
            data: &self.logic_buffer,
        }));
        sink.send(Packet::Analog(&self.analog_buffer));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::trigger::{TriggerConfig, TriggerStage};

    /// Owned copy of what a sink received
    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Recorded {
        Header,
        Logic(Vec<u16>),
        Analog(Vec<f32>),
        Trigger,
        Error,
        End(AcquisitionSummary),
    }

    #[derive(Debug, Default)]
    pub(crate) struct RecordingSink {
        pub(crate) packets: Vec<Recorded>,
    }

    impl RecordingSink {
        pub(crate) fn samples(&self) -> Vec<u16> {
            self.packets
                .iter()
                .filter_map(|p| match p {
                    Recorded::Logic(s) => Some(s.clone()),
                    _ => None,
                })
                .flatten()
                .collect()
        }

        pub(crate) fn count(&self, wanted: fn(&Recorded) -> bool) -> usize {
            self.packets.iter().filter(|p| wanted(p)).count()
        }
    }

    impl SampleSink for RecordingSink {
        fn send(&mut self, packet: Packet<'_>) {
            self.packets.push(match packet {
                Packet::Header { .. } => Recorded::Header,
                Packet::Logic(logic) => Recorded::Logic(logic.samples().collect()),
                Packet::Analog(values) => Recorded::Analog(values.to_vec()),
                Packet::Trigger => Recorded::Trigger,
                Packet::Error(_) => Recorded::Error,
                Packet::End(summary) => Recorded::End(summary),
            });
        }
    }

    fn no_trigger() -> TriggerMatcher {
        TriggerMatcher::disabled(SampleWidth::Bits8)
    }

    #[test]
    fn test_limit_truncates_mid_buffer() {
        let mut proc = SampleStreamProcessor::new(SampleWidth::Bits8, Some(5), 0, false);
        let mut matcher = no_trigger();
        let mut sink = RecordingSink::default();

        assert_eq!(
            proc.process(&[1, 2, 3], &mut matcher, &mut sink),
            StreamState::Continue
        );
        assert_eq!(
            proc.process(&[4, 5, 6, 7], &mut matcher, &mut sink),
            StreamState::LimitReached
        );
        assert_eq!(sink.samples(), vec![1, 2, 3, 4, 5]);
        assert_eq!(proc.sent_samples(), 5);

        // Nothing more once done
        assert_eq!(
            proc.process(&[8], &mut matcher, &mut sink),
            StreamState::LimitReached
        );
        assert_eq!(proc.sent_samples(), 5);
    }

    #[test]
    fn test_exact_limit_for_any_chunking() {
        for limit in [1u64, 7, 64, 100] {
            for chunk in [1usize, 3, 16] {
                let mut proc =
                    SampleStreamProcessor::new(SampleWidth::Bits8, Some(limit), 0, false);
                let mut matcher = no_trigger();
                let mut sink = RecordingSink::default();
                let mut limit_signals = 0;
                for _ in 0..200 {
                    let payload = vec![0xA5; chunk];
                    let state = proc.process(&payload, &mut matcher, &mut sink);
                    if state == StreamState::LimitReached {
                        limit_signals += 1;
                        break;
                    }
                }
                assert_eq!(limit_signals, 1);
                assert_eq!(sink.samples().len() as u64, limit);
            }
        }
    }

    #[test]
    fn test_wide_samples_little_endian() {
        let mut proc = SampleStreamProcessor::new(SampleWidth::Bits16, None, 0, false);
        let mut matcher = TriggerMatcher::disabled(SampleWidth::Bits16);
        let mut sink = RecordingSink::default();

        proc.process(&[0x34, 0x12, 0xCD, 0xAB, 0xFF], &mut matcher, &mut sink);
        assert_eq!(sink.samples(), vec![0x1234, 0xABCD]);
        assert_eq!(proc.sent_samples(), 2);
    }

    #[test]
    fn test_trigger_offset_applies() {
        let config = TriggerConfig::new(&[
            TriggerStage::new(0x01, 0x01),
            TriggerStage::new(0x02, 0x02),
        ])
        .unwrap();
        let mut matcher = TriggerMatcher::new(&config, SampleWidth::Bits8);
        let mut proc = SampleStreamProcessor::new(SampleWidth::Bits8, Some(10), 0, false);
        let mut sink = RecordingSink::default();

        proc.process(&[0x00, 0x01, 0x03, 0x05], &mut matcher, &mut sink);
        assert_eq!(
            sink.packets,
            vec![Recorded::Trigger, Recorded::Logic(vec![0x03, 0x05])]
        );
    }

    #[test]
    fn test_trigger_never_seen() {
        let config = TriggerConfig::new(&[TriggerStage::new(0xFF, 0x42)]).unwrap();
        let mut matcher = TriggerMatcher::new(&config, SampleWidth::Bits8);
        let mut proc = SampleStreamProcessor::new(SampleWidth::Bits8, Some(4), 0, false);
        let mut sink = RecordingSink::default();

        for _ in 0..10 {
            assert_eq!(
                proc.process(&[0, 1, 2, 3], &mut matcher, &mut sink),
                StreamState::Continue
            );
        }
        assert!(sink.packets.is_empty());
        assert_eq!(proc.sent_samples(), 0);
    }

    #[test]
    fn test_pre_trigger_samples_flushed_on_fire() {
        let config = TriggerConfig::new(&[TriggerStage::new(0xFF, 0x80)]).unwrap();
        let mut matcher = TriggerMatcher::new(&config, SampleWidth::Bits8);
        // 25% of 8 samples before the trigger
        let mut proc = SampleStreamProcessor::new(SampleWidth::Bits8, Some(8), 2, false);
        let mut sink = RecordingSink::default();

        proc.process(&[1, 2, 3], &mut matcher, &mut sink);
        assert_eq!(
            proc.process(&[4, 0x80, 5, 6, 7, 8, 9, 10], &mut matcher, &mut sink),
            StreamState::LimitReached
        );
        assert_eq!(
            sink.packets,
            vec![
                Recorded::Logic(vec![3, 4]),
                Recorded::Trigger,
                Recorded::Logic(vec![0x80, 5, 6, 7, 8, 9]),
            ]
        );
        assert_eq!(proc.sent_samples(), 8);
    }

    #[test]
    fn test_full_pre_trigger_ratio_ends_at_trigger() {
        let config = TriggerConfig::new(&[TriggerStage::new(0xFF, 0x80)]).unwrap();
        let mut matcher = TriggerMatcher::new(&config, SampleWidth::Bits8);
        // Capture ratio 100: every sample of the limit precedes the trigger
        let mut proc = SampleStreamProcessor::new(SampleWidth::Bits8, Some(4), 4, false);
        let mut sink = RecordingSink::default();

        assert_eq!(
            proc.process(&[1, 2, 3, 4, 5, 6], &mut matcher, &mut sink),
            StreamState::Continue
        );
        assert_eq!(
            proc.process(&[7, 0x80, 9], &mut matcher, &mut sink),
            StreamState::LimitReached
        );
        assert_eq!(sink.packets, vec![Recorded::Logic(vec![4, 5, 6, 7])]);
        assert_eq!(sink.count(|p| matches!(p, Recorded::Trigger)), 0);
        assert_eq!(proc.sent_samples(), 4);
        assert!(proc.is_done());
    }

    #[test]
    fn test_huge_pre_trigger_allocates_lazily() {
        let config = TriggerConfig::new(&[TriggerStage::new(0xFF, 0x80)]).unwrap();
        let mut matcher = TriggerMatcher::new(&config, SampleWidth::Bits8);
        let mut proc =
            SampleStreamProcessor::new(SampleWidth::Bits8, Some(1 << 40), 1 << 39, false);
        let mut sink = RecordingSink::default();

        assert!(proc.pre_trigger.capacity() < 1024);
        proc.process(&[1, 2, 3], &mut matcher, &mut sink);
        proc.process(&[0x80, 4], &mut matcher, &mut sink);
        assert_eq!(
            sink.packets,
            vec![
                Recorded::Logic(vec![1, 2, 3]),
                Recorded::Trigger,
                Recorded::Logic(vec![0x80, 4]),
            ]
        );

        let wide = SampleStreamProcessor::new(SampleWidth::Bits16, None, u64::MAX, false);
        assert_eq!(wide.pre_trigger_capacity, usize::MAX);
    }

    #[test]
    fn test_analog_pairs_are_split() {
        let mut proc = SampleStreamProcessor::new(SampleWidth::Bits16, None, 0, true);
        let mut matcher = TriggerMatcher::disabled(SampleWidth::Bits16);
        let mut sink = RecordingSink::default();

        proc.process(&[0x0F, 128, 0xF0, 138], &mut matcher, &mut sink);
        assert_eq!(
            sink.packets,
            vec![
                Recorded::Logic(vec![0x0F, 0xF0]),
                Recorded::Analog(vec![0.0, 10.0]),
            ]
        );
        assert_eq!(proc.sent_samples(), 2);
    }

    #[test]
    fn test_closure_sink() {
        let mut total = 0usize;
        let mut sink = |packet: Packet<'_>| {
            if let Packet::Logic(logic) = packet {
                total += logic.len();
            }
        };
        let mut proc = SampleStreamProcessor::new(SampleWidth::Bits8, None, 0, false);
        proc.process(&[0; 12], &mut no_trigger(), &mut sink);
        assert_eq!(total, 12);
    }
}
