//! Acquisition dispatch loop
//!
//! All transfer completions arrive on one bounded channel and are handled by
//! a single consumer, which owns every piece of live acquisition state. The
//! channel is sized to the pool, so the transport can never block on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};

use crate::constants::MAX_EMPTY_TRANSFERS;
use crate::context::DeviceContext;
use crate::error::{Fx2lafwError, Result};
use crate::stream::{
    AcquisitionSummary, Outcome, Packet, SampleSink, SampleStreamProcessor, StreamState,
};
use crate::transfer::{BulkTransport, Completion, PoolParams, SlotId, TransferPool, TransferStatus};
use crate::trigger::TriggerMatcher;

/// How often the dispatch loop looks at the abort flag while idle
const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Requests cancellation of a running acquisition from any thread
///
/// Aborting more than once has no further effect.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Create a handle that has not been triggered
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the acquisition to stop
    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Check if an abort was requested
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What to do with a slot after its completion was handled
enum Next {
    Resubmit,
    Release,
}

/// One capture session
///
/// Owns the transfer pool, the trigger matcher and the stream processor for
/// the lifetime of the capture.
pub struct Acquisition<T: BulkTransport, S: SampleSink> {
    transport: T,
    sink: S,
    pool: TransferPool,
    matcher: TriggerMatcher,
    processor: SampleStreamProcessor,
    samplerate: u64,
    abort_handle: AbortHandle,
    acq_aborted: bool,
    empty_transfer_count: u32,
    outcome: Option<Outcome>,
    error: Option<Fx2lafwError>,
    started: bool,
    finished: bool,
}

impl<T: BulkTransport, S: SampleSink> Acquisition<T, S> {
    /// Prepare a capture with the context's settings
    pub fn new(context: &DeviceContext, params: PoolParams, transport: T, sink: S) -> Self {
        let profile = context.profile();
        Self {
            transport,
            sink,
            pool: TransferPool::new(params, profile.variant.data_endpoint()),
            matcher: context.trigger_matcher(),
            processor: SampleStreamProcessor::new(
                context.sample_width(),
                context.limit_samples(),
                context.pre_trigger_samples(),
                profile.supports_analog(),
            ),
            samplerate: context.samplerate(),
            abort_handle: AbortHandle::new(),
            acq_aborted: false,
            empty_transfer_count: 0,
            outcome: None,
            error: None,
            started: false,
            finished: false,
        }
    }

    /// Use an abort handle shared with another thread
    pub fn with_abort_handle(mut self, handle: AbortHandle) -> Self {
        self.abort_handle = handle;
        self
    }

    /// Handle that cancels this acquisition
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// The transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The transport, mutably
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// The sink
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Samples delivered so far
    pub fn sent_samples(&self) -> u64 {
        self.processor.sent_samples()
    }

    /// Transfers currently outstanding
    pub fn submitted_transfers(&self) -> usize {
        self.pool.submitted()
    }

    /// Consecutive empty or failed completions
    pub fn empty_transfer_count(&self) -> u32 {
        self.empty_transfer_count
    }

    /// Whether the trigger has fired
    pub fn trigger_fired(&self) -> bool {
        self.matcher.fired()
    }

    /// Whether no more transfers will be submitted
    pub fn is_aborted(&self) -> bool {
        self.acq_aborted
    }

    /// Whether every transfer has drained and the sink got its end packet
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Report of the acquisition so far
    pub fn summary(&self) -> AcquisitionSummary {
        AcquisitionSummary {
            sent_samples: self.processor.sent_samples(),
            trigger_fired: self.matcher.fired(),
            outcome: self.outcome.unwrap_or(Outcome::Cancelled),
        }
    }

    /// Send the header and submit the whole pool
    ///
    /// A refused submission ends the acquisition; `run` still has to be called
    /// to drain the transfers that did go out. Starting twice is refused.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Fx2lafwError::AlreadyRunning);
        }
        self.started = true;

        log::info!(
            "Starting acquisition at {} Hz, {} transfers",
            self.samplerate,
            self.pool.capacity()
        );
        self.sink.send(Packet::Header {
            samplerate: self.samplerate,
            unit_size: self.processor.unit_size(),
        });

        if let Err(e) = self.pool.submit_all(&mut self.transport) {
            self.fail(e);
        }
        Ok(())
    }

    /// Request a clean early stop
    pub fn abort(&mut self) {
        self.stop(Outcome::Cancelled);
    }

    /// End the acquisition with a fatal error
    ///
    /// Only the first error is reported to the sink.
    pub fn fail(&mut self, error: Fx2lafwError) {
        if self.acq_aborted {
            log::debug!("Ignoring error after abort: {}", error);
            return;
        }
        log::error!("Acquisition failed: {}", error);
        let outcome = match error {
            Fx2lafwError::Stalled { .. } => Outcome::Stalled,
            Fx2lafwError::Disconnected { .. } => Outcome::Disconnected,
            _ => Outcome::Failed,
        };
        self.sink.send(Packet::Error(&error));
        self.error = Some(error);
        self.stop(outcome);
    }

    fn stop(&mut self, outcome: Outcome) {
        if self.acq_aborted {
            return;
        }
        log::debug!("Stopping acquisition: {:?}", outcome);
        self.acq_aborted = true;
        self.outcome = Some(outcome);
        self.transport.cancel_all();
        self.maybe_finish();
    }

    fn maybe_finish(&mut self) {
        if self.finished || !self.acq_aborted || !self.pool.is_drained() {
            return;
        }
        self.finished = true;
        let summary = self.summary();
        log::info!(
            "Acquisition finished: {} samples, {:?}",
            summary.sent_samples,
            summary.outcome
        );
        self.sink.send(Packet::End(summary));
    }

    /// Handle one transfer completion
    pub fn handle_completion(&mut self, mut completion: Completion) {
        let slot = completion.slot;
        let next = if self.acq_aborted {
            Next::Release
        } else {
            self.consume(&completion)
        };

        self.pool.reclaim(&mut completion);
        match next {
            Next::Resubmit => self.resubmit(slot),
            Next::Release => self.pool.release(slot),
        }
        self.maybe_finish();
    }

    fn consume(&mut self, completion: &Completion) -> Next {
        log::debug!(
            "Transfer {}: status {:?}, received {} bytes",
            completion.slot,
            completion.status,
            completion.actual_length
        );

        if completion.status == TransferStatus::NoDevice {
            self.fail(Fx2lafwError::Disconnected {
                sent_samples: self.processor.sent_samples(),
            });
            return Next::Release;
        }

        let payload = completion.payload();
        if !completion.status.carries_data() || payload.is_empty() {
            self.empty_transfer_count += 1;
            if !completion.status.carries_data() {
                log::warn!(
                    "Transfer {} failed with {:?} ({} in a row)",
                    completion.slot,
                    completion.status,
                    self.empty_transfer_count
                );
            }
            if self.empty_transfer_count >= MAX_EMPTY_TRANSFERS {
                self.fail(Fx2lafwError::Stalled {
                    empty_transfers: self.empty_transfer_count,
                    sent_samples: self.processor.sent_samples(),
                });
                return Next::Release;
            }
            return Next::Resubmit;
        }
        self.empty_transfer_count = 0;

        match self
            .processor
            .process(payload, &mut self.matcher, &mut self.sink)
        {
            StreamState::Continue => Next::Resubmit,
            StreamState::LimitReached => {
                self.stop(Outcome::LimitReached);
                Next::Release
            }
        }
    }

    fn resubmit(&mut self, slot: SlotId) {
        if self.acq_aborted {
            self.pool.release(slot);
            return;
        }
        if let Err(e) = self.pool.submit(slot, &mut self.transport) {
            self.fail(e);
        }
    }

    /// Dispatch completions until every transfer has drained
    ///
    /// Returns the summary for limit-reached and cancelled captures, and the
    /// fatal error otherwise. The delivered sample count stays available through
    /// `sent_samples` either way.
    pub fn run(&mut self, completions: &Receiver<Completion>) -> Result<AcquisitionSummary> {
        if !self.started {
            self.start()?;
        }

        while !self.finished {
            if self.abort_handle.is_aborted() {
                self.abort();
                if self.finished {
                    break;
                }
            }
            match completions.recv_timeout(ABORT_POLL_INTERVAL) {
                Ok(completion) => self.handle_completion(completion),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // The transport dropped every outstanding buffer with its sender
                    self.fail(Fx2lafwError::Disconnected {
                        sent_samples: self.processor.sent_samples(),
                    });
                    self.pool.abandon_in_flight();
                    self.maybe_finish();
                }
            }
        }

        match self.error.take() {
            Some(error) => Err(error),
            None => Ok(self.summary()),
        }
    }
}
