//! Bulk transport over libusb asynchronous transfers
//!
//! Every pool slot is submitted as its own libusb bulk transfer, so the whole
//! pool is in flight at once. A dedicated thread pumps libusb events; the
//! transfer callbacks turn finished transfers into [`Completion`]s on the
//! channel the transport was created with.

use std::collections::HashMap;
use std::os::raw::{c_int, c_uint, c_void};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Sender, TrySendError};
use rusb::ffi::{self, constants::*, libusb_transfer};
use rusb::{DeviceHandle, GlobalContext, UsbContext};

use crate::error::{Fx2lafwError, Result};
use crate::transfer::{BulkTransport, Completion, SlotId, TransferRequest, TransferStatus};

/// How long the event thread blocks in one round of event handling
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long shutdown waits for cancelled transfers to come back
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Called exactly once when a submitted transfer has finished
pub type CompletionFn = Box<dyn FnOnce(Completion) + Send>;

/// Asynchronous USB primitives the transport is built on
pub trait AsyncBackend: Send + Sync + 'static {
    /// Queue a bulk IN transfer; `done` runs from `handle_events` once it ends
    fn submit_bulk(&self, request: TransferRequest, done: CompletionFn) -> Result<()>;

    /// Ask every unfinished transfer to end
    fn cancel_all(&self);

    /// Run the callbacks of finished transfers, waiting up to `timeout`
    fn handle_events(&self, timeout: Duration) -> Result<()>;
}

struct Shared<B> {
    backend: B,
    in_flight: Arc<AtomicUsize>,
    closing: AtomicBool,
}

/// Bulk transport keeping every submitted transfer outstanding at once
///
/// Completions are posted with `try_send`, so the channel must hold at least
/// as many entries as transfers can be in flight.
pub struct AsyncTransport<B: AsyncBackend> {
    shared: Arc<Shared<B>>,
    completions: Sender<Completion>,
    events: Option<JoinHandle<()>>,
}

/// Transport used against real hardware
pub type RusbTransport = AsyncTransport<RusbBackend>;

impl<B: AsyncBackend> AsyncTransport<B> {
    /// Spawn the event thread
    pub fn new(backend: B, completions: Sender<Completion>) -> Result<Self> {
        let shared = Arc::new(Shared {
            backend,
            in_flight: Arc::new(AtomicUsize::new(0)),
            closing: AtomicBool::new(false),
        });

        let worker_shared = shared.clone();
        let events = std::thread::Builder::new()
            .name("fx2lafw-events".to_string())
            .spawn(move || event_loop(worker_shared))
            .map_err(|e| Fx2lafwError::SubmitTransfer(e.to_string()))?;

        Ok(Self {
            shared,
            completions,
            events: Some(events),
        })
    }

    /// Transfers submitted and not completed yet
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// The underlying backend
    pub fn backend(&self) -> &B {
        &self.shared.backend
    }
}

fn event_loop<B: AsyncBackend>(shared: Arc<Shared<B>>) {
    let mut drain_deadline = None;
    loop {
        if shared.closing.load(Ordering::Acquire) {
            let outstanding = shared.in_flight.load(Ordering::Acquire);
            if outstanding == 0 {
                break;
            }
            let deadline = *drain_deadline.get_or_insert_with(|| Instant::now() + DRAIN_TIMEOUT);
            if Instant::now() >= deadline {
                log::error!("Giving up on {} bulk transfer(s) still in flight", outstanding);
                break;
            }
        }

        if let Err(e) = shared.backend.handle_events(EVENT_POLL_INTERVAL) {
            log::warn!("USB event handling failed: {}", e);
            std::thread::sleep(EVENT_POLL_INTERVAL);
        }
    }
    log::debug!("USB event thread stopped");
}

impl<B: AsyncBackend> BulkTransport for AsyncTransport<B> {
    fn submit(&mut self, request: TransferRequest) -> Result<()> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(Fx2lafwError::SubmitTransfer("transport closed".to_string()));
        }

        let completions = self.completions.clone();
        let in_flight = self.shared.in_flight.clone();
        let done: CompletionFn = Box::new(move |completion: Completion| {
            match completions.try_send(completion) {
                Ok(()) => {}
                Err(TrySendError::Full(c)) => {
                    log::error!("Completion channel full, dropping slot {}", c.slot)
                }
                Err(TrySendError::Disconnected(c)) => {
                    log::debug!("Completion receiver gone, dropping slot {}", c.slot)
                }
            }
            in_flight.fetch_sub(1, Ordering::AcqRel);
        });

        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.shared.backend.submit_bulk(request, done) {
            self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }
        Ok(())
    }

    fn cancel_all(&mut self) {
        self.shared.backend.cancel_all();
    }
}

impl<B: AsyncBackend> Drop for AsyncTransport<B> {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::Release);
        self.shared.backend.cancel_all();
        if let Some(events) = self.events.take() {
            if events.join().is_err() {
                log::error!("USB event thread panicked");
            }
        }
    }
}

/// Map a libusb transfer status code
pub fn status_from_libusb(status: c_int) -> TransferStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

/// Transfer owned by libusb until its callback runs
struct TransferPtr(NonNull<libusb_transfer>);

// The pointer is only dereferenced by libusb calls made under the table lock
unsafe impl Send for TransferPtr {}

type TransferTable = Arc<Mutex<HashMap<SlotId, TransferPtr>>>;

/// State travelling with a transfer through libusb's `user_data`
struct PendingTransfer {
    slot: SlotId,
    buffer: Vec<u8>,
    done: CompletionFn,
    table: TransferTable,
}

extern "system" fn transfer_callback(transfer: *mut libusb_transfer) {
    // SAFETY: libusb hands back the transfer filled in `submit_bulk`, whose
    // user_data is the leaked `PendingTransfer`. The callback runs once.
    let (pending, status, actual_length) = unsafe {
        let pending = Box::from_raw((*transfer).user_data as *mut PendingTransfer);
        let status = status_from_libusb((*transfer).status);
        let actual_length = (*transfer).actual_length.max(0) as usize;
        (pending, status, actual_length)
    };

    let PendingTransfer {
        slot,
        buffer,
        done,
        table,
    } = *pending;
    match table.lock() {
        Ok(mut table) => {
            table.remove(&slot);
        }
        Err(poisoned) => {
            poisoned.into_inner().remove(&slot);
        }
    }
    // SAFETY: the transfer left the table, nothing references it any more
    unsafe { ffi::libusb_free_transfer(transfer) };

    done(Completion {
        slot,
        status,
        buffer,
        actual_length,
    });
}

/// libusb backend for a claimed device handle
pub struct RusbBackend {
    handle: Arc<DeviceHandle<GlobalContext>>,
    table: TransferTable,
}

impl RusbBackend {
    /// Create a backend; the interface must already be claimed
    pub fn new(handle: Arc<DeviceHandle<GlobalContext>>) -> Self {
        Self {
            handle,
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<SlotId, TransferPtr>> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AsyncBackend for RusbBackend {
    fn submit_bulk(&self, request: TransferRequest, done: CompletionFn) -> Result<()> {
        let TransferRequest {
            slot,
            endpoint,
            mut buffer,
            timeout,
        } = request;

        // SAFETY: plain allocation, checked for null below
        let transfer = NonNull::new(unsafe { ffi::libusb_alloc_transfer(0) }).ok_or_else(|| {
            Fx2lafwError::SubmitTransfer(format!("cannot allocate transfer for slot {}", slot))
        })?;

        let length = buffer.len() as c_int;
        let data = buffer.as_mut_ptr();
        let pending = Box::into_raw(Box::new(PendingTransfer {
            slot,
            buffer,
            done,
            table: self.table.clone(),
        }));

        // Held across submission so the callback cannot run before the entry exists
        let mut table = self.table();
        // SAFETY: the buffer's heap block moved into `pending` unchanged and
        // stays alive until the callback reclaims `pending`
        let rc = unsafe {
            ffi::libusb_fill_bulk_transfer(
                transfer.as_ptr(),
                self.handle.as_raw(),
                endpoint,
                data,
                length,
                transfer_callback,
                pending as *mut c_void,
                timeout.as_millis().min(c_uint::MAX as u128) as c_uint,
            );
            ffi::libusb_submit_transfer(transfer.as_ptr())
        };
        if rc != 0 {
            // SAFETY: libusb refused the transfer, so both allocations are ours again
            unsafe {
                drop(Box::from_raw(pending));
                ffi::libusb_free_transfer(transfer.as_ptr());
            }
            return Err(Fx2lafwError::SubmitTransfer(format!(
                "libusb error {} on slot {}",
                rc, slot
            )));
        }
        table.insert(slot, TransferPtr(transfer));
        Ok(())
    }

    fn cancel_all(&self) {
        let table = self.table();
        for (slot, transfer) in table.iter() {
            // SAFETY: entries are removed before their transfer is freed
            let rc = unsafe { ffi::libusb_cancel_transfer(transfer.0.as_ptr()) };
            if rc != 0 && rc != ffi::constants::LIBUSB_ERROR_NOT_FOUND {
                log::debug!("Cancelling slot {} failed: libusb error {}", slot, rc);
            }
        }
    }

    fn handle_events(&self, timeout: Duration) -> Result<()> {
        match self.handle.context().handle_events(Some(timeout)) {
            Ok(()) | Err(rusb::Error::Interrupted) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RusbBackend {
    fn drop(&mut self) {
        let leaked = self.table().len();
        if leaked > 0 {
            // libusb still owns these transfers and their buffers
            log::error!("Leaking {} unfinished bulk transfer(s)", leaked);
            std::mem::forget(self.handle.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use crossbeam::channel::{bounded, Receiver};

    use crate::acquisition::Acquisition;
    use crate::context::DeviceContext;
    use crate::profile::find_profile;
    use crate::stream::tests::RecordingSink;
    use crate::stream::Outcome;
    use crate::transfer::PoolParams;

    /// Backend that completes transfers only when told to
    #[derive(Default)]
    struct ManualBackend {
        queued: Mutex<VecDeque<(TransferRequest, CompletionFn)>>,
        /// Transfers allowed to complete on the next event rounds
        ready: AtomicUsize,
        cancelled: AtomicBool,
        refuse: bool,
        max_queued: AtomicUsize,
    }

    impl ManualBackend {
        fn queued(&self) -> usize {
            self.queued.lock().unwrap().len()
        }
    }

    impl AsyncBackend for ManualBackend {
        fn submit_bulk(&self, request: TransferRequest, done: CompletionFn) -> Result<()> {
            if self.refuse {
                return Err(Fx2lafwError::SubmitTransfer("refused".to_string()));
            }
            let mut queued = self.queued.lock().unwrap();
            queued.push_back((request, done));
            self.max_queued.fetch_max(queued.len(), Ordering::SeqCst);
            Ok(())
        }

        fn cancel_all(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }

        fn handle_events(&self, timeout: Duration) -> Result<()> {
            let mut finished = Vec::new();
            {
                let mut queued = self.queued.lock().unwrap();
                let cancelled = self.cancelled.load(Ordering::SeqCst);
                while let Some((request, done)) = queued.pop_front() {
                    if cancelled {
                        finished.push((request, done, TransferStatus::Cancelled));
                    } else if self
                        .ready
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                    {
                        finished.push((request, done, TransferStatus::Completed));
                    } else {
                        queued.push_front((request, done));
                        break;
                    }
                }
            }
            if finished.is_empty() {
                std::thread::sleep(timeout.min(Duration::from_millis(2)));
            }
            for (mut request, done, status) in finished {
                let actual_length = if status == TransferStatus::Completed {
                    request.buffer.fill(request.slot as u8);
                    request.buffer.len()
                } else {
                    0
                };
                done(Completion {
                    slot: request.slot,
                    status,
                    buffer: request.buffer,
                    actual_length,
                });
            }
            Ok(())
        }
    }

    fn request(slot: SlotId) -> TransferRequest {
        TransferRequest {
            slot,
            endpoint: 0x82,
            buffer: vec![0u8; 8],
            timeout: Duration::from_millis(100),
        }
    }

    fn transport(
        backend: ManualBackend,
        depth: usize,
    ) -> (AsyncTransport<ManualBackend>, Receiver<Completion>) {
        let (tx, rx) = bounded(depth);
        (AsyncTransport::new(backend, tx).unwrap(), rx)
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_transfers_outstanding_together() {
        let (mut transport, rx) = transport(ManualBackend::default(), 4);
        for slot in 0..4 {
            transport.submit(request(slot)).unwrap();
        }

        // Nothing completed yet, all four are owned by the backend
        assert_eq!(transport.in_flight(), 4);
        assert_eq!(transport.backend().queued(), 4);
        assert!(rx.try_recv().is_err());

        transport.backend().ready.store(4, Ordering::SeqCst);
        for slot in 0..4 {
            let c = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(c.slot, slot);
            assert_eq!(c.status, TransferStatus::Completed);
            assert_eq!(c.payload(), &[slot as u8; 8]);
        }
        wait_until(|| transport.in_flight() == 0);
        assert_eq!(transport.backend().max_queued.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_completions_keep_submission_order() {
        let (mut transport, rx) = transport(ManualBackend::default(), 3);
        for slot in [2, 0, 1] {
            transport.submit(request(slot)).unwrap();
        }
        transport.backend().ready.store(1, Ordering::SeqCst);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().slot, 2);

        transport.submit(request(2)).unwrap();
        transport.backend().ready.store(3, Ordering::SeqCst);
        let order: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().slot)
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_cancel_returns_every_buffer() {
        let (mut transport, rx) = transport(ManualBackend::default(), 3);
        for slot in 0..3 {
            transport.submit(request(slot)).unwrap();
        }
        transport.cancel_all();

        for slot in 0..3 {
            let c = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(c.slot, slot);
            assert_eq!(c.status, TransferStatus::Cancelled);
            assert_eq!(c.buffer.len(), 8);
            assert!(c.payload().is_empty());
        }
        wait_until(|| transport.in_flight() == 0);
    }

    #[test]
    fn test_drop_drains_outstanding_transfers() {
        let (mut transport, rx) = transport(ManualBackend::default(), 2);
        transport.submit(request(0)).unwrap();
        transport.submit(request(1)).unwrap();
        drop(transport);

        // The event thread has been joined, both buffers came back
        let statuses: Vec<_> = rx.try_iter().map(|c| (c.slot, c.status)).collect();
        assert_eq!(
            statuses,
            vec![(0, TransferStatus::Cancelled), (1, TransferStatus::Cancelled)]
        );
    }

    #[test]
    fn test_refused_submission_not_counted() {
        let backend = ManualBackend {
            refuse: true,
            ..Default::default()
        };
        let (mut transport, _rx) = transport(backend, 1);
        assert!(matches!(
            transport.submit(request(0)),
            Err(Fx2lafwError::SubmitTransfer(_))
        ));
        assert_eq!(transport.in_flight(), 0);
    }

    #[test]
    fn test_status_from_libusb() {
        assert_eq!(status_from_libusb(LIBUSB_TRANSFER_COMPLETED), TransferStatus::Completed);
        assert_eq!(status_from_libusb(LIBUSB_TRANSFER_TIMED_OUT), TransferStatus::TimedOut);
        assert_eq!(status_from_libusb(LIBUSB_TRANSFER_CANCELLED), TransferStatus::Cancelled);
        assert_eq!(status_from_libusb(LIBUSB_TRANSFER_STALL), TransferStatus::Stall);
        assert_eq!(status_from_libusb(LIBUSB_TRANSFER_NO_DEVICE), TransferStatus::NoDevice);
        assert_eq!(status_from_libusb(LIBUSB_TRANSFER_OVERFLOW), TransferStatus::Overflow);
        assert_eq!(status_from_libusb(LIBUSB_TRANSFER_ERROR), TransferStatus::Error);
        assert_eq!(status_from_libusb(42), TransferStatus::Error);
    }

    #[test]
    fn test_acquisition_keeps_pool_in_flight() {
        let mut context = DeviceContext::new(find_profile(0x0925, 0x3881, "", "").unwrap());
        context.set_limit_samples(Some(64));
        let params = PoolParams {
            num_transfers: 4,
            buffer_size: 8,
            timeout: Duration::from_millis(100),
        };
        let (tx, rx) = bounded(params.num_transfers);
        let transport = AsyncTransport::new(ManualBackend::default(), tx).unwrap();
        let mut acquisition =
            Acquisition::new(&context, params, transport, RecordingSink::default());

        acquisition.start().unwrap();
        assert_eq!(acquisition.transport().in_flight(), 4);
        acquisition.transport().backend().ready.store(usize::MAX, Ordering::SeqCst);

        let summary = acquisition.run(&rx).unwrap();
        assert_eq!(summary.outcome, Outcome::LimitReached);
        assert_eq!(summary.sent_samples, 64);
        assert_eq!(acquisition.sink().samples().len(), 64);
        assert_eq!(
            acquisition.transport().backend().max_queued.load(Ordering::SeqCst),
            4
        );
    }
}
