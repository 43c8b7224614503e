//! Renumeration guard
//!
//! An FX2 disappears from the bus after a firmware upload and comes back at a
//! new address. Until it has settled, no device of the same family may be
//! opened, because the handle could belong to the device that is still
//! renumerating.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::constants::MAX_RENUM_DELAY_MS;
use crate::error::{Fx2lafwError, Result};
use crate::profile::DeviceFamily;

/// Last firmware upload time per device family
#[derive(Debug)]
pub struct RenumerationRegistry {
    uploads: Mutex<HashMap<DeviceFamily, Instant>>,
    delay: Duration,
}

impl Default for RenumerationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RenumerationRegistry {
    /// Create a registry with the standard `MAX_RENUM_DELAY_MS` window
    pub fn new() -> Self {
        Self::with_delay(Duration::from_millis(MAX_RENUM_DELAY_MS))
    }

    /// Create a registry with a custom window
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            uploads: Mutex::new(HashMap::new()),
            delay,
        }
    }

    fn uploads(&self) -> std::sync::MutexGuard<'_, HashMap<DeviceFamily, Instant>> {
        // The map stays consistent even if a holder panicked
        self.uploads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a firmware upload to a device of `family` at `at`
    pub fn record_firmware_upload(&self, family: DeviceFamily, at: Instant) {
        log::debug!("Firmware uploaded to a {:?} device", family);
        self.uploads().insert(family, at);
    }

    /// Check whether a device of `family` may be opened at `now`
    ///
    /// Refuses with the retryable `RenumerationPending` while the window is
    /// open. The check and the clearing of an expired entry happen under one lock.
    pub fn check_open(&self, family: DeviceFamily, now: Instant) -> Result<()> {
        let mut uploads = self.uploads();
        let Some(&uploaded) = uploads.get(&family) else {
            return Ok(());
        };
        let elapsed = now.saturating_duration_since(uploaded);
        if elapsed < self.delay {
            let remaining = self.delay - elapsed;
            return Err(Fx2lafwError::RenumerationPending {
                remaining_ms: remaining.as_millis() as u64,
            });
        }
        uploads.remove(&family);
        Ok(())
    }

    /// Check whether a device of `family` may be opened now
    pub fn check_open_now(&self, family: DeviceFamily) -> Result<()> {
        self.check_open(family, Instant::now())
    }
}
