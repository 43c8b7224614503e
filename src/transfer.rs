//! Bulk transfer pool
//!
//! A fixed arena of buffer slots. A slot's buffer is handed to the transport
//! while the transfer is in flight and comes back with its completion, so a
//! buffer can never be reused while the device may still write into it.

use std::time::Duration;

use crate::constants::{
    MAX_BUFFER_SIZE, MIN_TRANSFER_TIMEOUT_MS, NUM_SIMUL_TRANSFERS, TRANSFER_BUFFER_ALIGN,
    TRANSFER_BUFFER_MS, TRANSFER_POOL_MS, USB_ENDPOINT_IN,
};
use crate::error::Result;
use crate::structures::SampleWidth;

/// Index of a slot in the transfer pool
pub type SlotId = usize;

/// How a bulk transfer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Transfer finished, possibly short
    Completed,
    /// Timed out; some data may still have arrived
    TimedOut,
    /// Endpoint stalled
    Stall,
    /// Device is gone
    NoDevice,
    /// Device sent more data than requested
    Overflow,
    /// Transfer was cancelled
    Cancelled,
    /// Any other failure
    Error,
}

impl TransferStatus {
    /// Check if the payload of a transfer with this status may hold samples
    pub fn carries_data(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::TimedOut)
    }
}

impl From<rusb::Error> for TransferStatus {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => TransferStatus::TimedOut,
            rusb::Error::Pipe => TransferStatus::Stall,
            rusb::Error::NoDevice => TransferStatus::NoDevice,
            rusb::Error::Overflow => TransferStatus::Overflow,
            rusb::Error::Interrupted => TransferStatus::Cancelled,
            _ => TransferStatus::Error,
        }
    }
}

/// A bulk read handed to the transport
#[derive(Debug)]
pub struct TransferRequest {
    /// Slot the buffer belongs to
    pub slot: SlotId,
    /// Endpoint address, including the IN direction bit
    pub endpoint: u8,
    /// Buffer to fill
    pub buffer: Vec<u8>,
    /// Transfer timeout
    pub timeout: Duration,
}

/// A finished bulk read
#[derive(Debug)]
pub struct Completion {
    /// Slot the buffer belongs to
    pub slot: SlotId,
    /// How the transfer ended
    pub status: TransferStatus,
    /// The buffer, returned to the pool
    pub buffer: Vec<u8>,
    /// Bytes the device wrote into the buffer
    pub actual_length: usize,
}

impl Completion {
    /// Bytes received
    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.actual_length.min(self.buffer.len())]
    }
}

/// Asynchronous bulk transport
///
/// Completions are delivered out of band, in submission order, on the channel
/// the transport was created with.
pub trait BulkTransport {
    /// Queue a bulk read
    fn submit(&mut self, request: TransferRequest) -> Result<()>;

    /// Ask every outstanding transfer to complete as soon as possible
    fn cancel_all(&mut self);
}

/// Pool dimensions derived from the sample rate and width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolParams {
    /// Number of concurrently outstanding transfers
    pub num_transfers: usize,
    /// Bytes per transfer buffer
    pub buffer_size: usize,
    /// Per-transfer timeout
    pub timeout: Duration,
}

fn bytes_per_ms(samplerate: u64, width: SampleWidth) -> u64 {
    (samplerate * width.unit_size() as u64 / 1000).max(1)
}

impl PoolParams {
    /// Size the pool for a sample rate
    ///
    /// A buffer holds about 10 ms of samples, rounded up to the bulk packet size
    /// and capped at `MAX_BUFFER_SIZE`. The pool holds about 500 ms of samples,
    /// capped at `NUM_SIMUL_TRANSFERS`. The timeout is the time to fill the whole
    /// pool plus 25% headroom.
    pub fn for_samplerate(samplerate: u64, width: SampleWidth) -> Self {
        let bpms = bytes_per_ms(samplerate, width);

        let align = TRANSFER_BUFFER_ALIGN as u64;
        let buffer_size = (TRANSFER_BUFFER_MS * bpms).div_ceil(align) * align;
        let buffer_size = buffer_size.clamp(align, MAX_BUFFER_SIZE as u64);

        let num_transfers =
            (TRANSFER_POOL_MS * bpms / buffer_size).clamp(1, NUM_SIMUL_TRANSFERS as u64);

        let timeout = buffer_size * num_transfers / bpms;
        let timeout = (timeout + timeout / 4).max(MIN_TRANSFER_TIMEOUT_MS);

        Self {
            num_transfers: num_transfers as usize,
            buffer_size: buffer_size as usize,
            timeout: Duration::from_millis(timeout),
        }
    }
}

/// Fixed-capacity arena of transfer buffers
#[derive(Debug)]
pub struct TransferPool {
    /// `Some` while parked in the pool, `None` while owned by the transport
    slots: Vec<Option<Vec<u8>>>,
    free: Vec<SlotId>,
    submitted: usize,
    endpoint: u8,
    timeout: Duration,
}

impl TransferPool {
    /// Allocate every buffer of the pool
    pub fn new(params: PoolParams, endpoint: u8) -> Self {
        let slots = (0..params.num_transfers)
            .map(|_| Some(vec![0u8; params.buffer_size]))
            .collect();
        // Reversed so slots are handed out in index order
        let free = (0..params.num_transfers).rev().collect();
        Self {
            slots,
            free,
            submitted: 0,
            endpoint: endpoint | USB_ENDPOINT_IN,
            timeout: params.timeout,
        }
    }

    /// Pool capacity
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Transfers currently owned by the transport
    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Check if no transfer is outstanding
    pub fn is_drained(&self) -> bool {
        self.submitted == 0
    }

    /// Submit every free slot
    pub fn submit_all(&mut self, transport: &mut dyn BulkTransport) -> Result<()> {
        while let Some(slot) = self.free.pop() {
            self.submit(slot, transport)?;
        }
        Ok(())
    }

    /// Submit one parked slot
    ///
    /// If the transport refuses, the buffer is lost and the slot is retired.
    pub fn submit(&mut self, slot: SlotId, transport: &mut dyn BulkTransport) -> Result<()> {
        let Some(buffer) = self.slots.get_mut(slot).and_then(Option::take) else {
            log::error!("Slot {} is not parked in the pool", slot);
            return Ok(());
        };
        self.free.retain(|&s| s != slot);
        let request = TransferRequest {
            slot,
            endpoint: self.endpoint,
            buffer,
            timeout: self.timeout,
        };
        transport.submit(request)?;
        self.submitted += 1;
        debug_assert!(self.submitted <= self.capacity());
        Ok(())
    }

    /// Take back the buffer of a completed transfer
    ///
    /// The slot stays parked; the caller either resubmits it or releases it.
    pub fn reclaim(&mut self, completion: &mut Completion) {
        match self.slots.get_mut(completion.slot) {
            Some(slot) if slot.is_none() => {
                *slot = Some(std::mem::take(&mut completion.buffer));
                self.submitted -= 1;
            }
            _ => log::error!(
                "Completion for slot {} which is not in flight",
                completion.slot
            ),
        }
    }

    /// Return a parked slot to the free list
    pub fn release(&mut self, slot: SlotId) {
        if matches!(self.slots.get(slot), Some(Some(_))) && !self.free.contains(&slot) {
            self.free.push(slot);
        }
    }

    /// Forget every outstanding transfer
    ///
    /// Used when the transport went away with the buffers it held.
    pub fn abandon_in_flight(&mut self) {
        if self.submitted > 0 {
            log::warn!("Abandoning {} outstanding transfer(s)", self.submitted);
        }
        self.submitted = 0;
    }

    /// Slots currently on the free list
    pub fn free_slots(&self) -> usize {
        self.free.len()
    }
}
