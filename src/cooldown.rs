//! Per-camera alert cooldown.
//!
//! The gate remembers when each camera last delivered an alert and admits a new
//! attempt only once the cooldown has elapsed. State lives in memory for the
//! life of the process; a restart forgets every camera.
//!
//! Check-then-record must not race: two requests for the same camera could
//! both pass `admit` before either records. [`CooldownGate::try_acquire`]
//! closes that gap by reserving the camera's slot inside the same critical
//! section as the check. Further attempts for that camera wait until the
//! reservation is committed or dropped and are then checked again, so a failed
//! delivery never swallows the attempt queued behind it. The lock is never held
//! across I/O.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// Source of monotonic time for the gate.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Default)]
struct CameraSlot {
    last_alert: Option<Instant>,
    in_flight: bool,
}

#[derive(Debug)]
pub struct CooldownGate {
    cooldown: Duration,
    cameras: Mutex<HashMap<String, CameraSlot>>,
    released: Condvar,
}

impl Default for CooldownGate {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

impl CooldownGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            cameras: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Would an alert for `camera_id` at `now` be admitted?
    ///
    /// Cameras without a recorded alert are always admitted.
    pub fn admit(&self, camera_id: &str, now: Instant) -> bool {
        let cameras = self.lock();
        match cameras.get(camera_id) {
            Some(slot) => self.elapsed(slot, now),
            None => true,
        }
    }

    /// Record a delivered alert. Timestamps only move forward.
    pub fn record(&self, camera_id: &str, now: Instant) {
        let mut cameras = self.lock();
        let slot = cameras.entry(camera_id.to_string()).or_default();
        slot.last_alert = Some(match slot.last_alert {
            Some(prev) if prev > now => prev,
            _ => now,
        });
    }

    /// Last recorded alert for `camera_id`, if any.
    pub fn last_alert(&self, camera_id: &str) -> Option<Instant> {
        self.lock().get(camera_id).and_then(|slot| slot.last_alert)
    }

    /// Check and reserve in one step.
    ///
    /// Blocks while another attempt for `camera_id` holds the slot, then
    /// checks the cooldown against whatever that attempt left behind. Returns
    /// `None` when the camera is cooling down. The returned permit must be
    /// committed to record the alert; dropping it releases the reservation and
    /// leaves the timestamp untouched.
    pub fn try_acquire(&self, camera_id: &str, now: Instant) -> Option<AlertPermit<'_>> {
        let mut cameras = self.lock();
        loop {
            let slot = cameras.entry(camera_id.to_string()).or_default();
            if !slot.in_flight {
                if !self.elapsed(slot, now) {
                    return None;
                }
                slot.in_flight = true;
                return Some(AlertPermit {
                    gate: self,
                    camera_id: camera_id.to_string(),
                });
            }
            cameras = self
                .released
                .wait(cameras)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn release(&self, camera_id: &str) {
        if let Some(slot) = self.lock().get_mut(camera_id) {
            slot.in_flight = false;
        }
        self.released.notify_all();
    }

    fn elapsed(&self, slot: &CameraSlot, now: Instant) -> bool {
        match slot.last_alert {
            Some(last) => now.saturating_duration_since(last) >= self.cooldown,
            None => true,
        }
    }

    // A panic while holding the lock cannot leave a slot half-written, so a
    // poisoned map is still usable.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, CameraSlot>> {
        self.cameras
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Reservation on one camera's cooldown slot.
#[derive(Debug)]
pub struct AlertPermit<'a> {
    gate: &'a CooldownGate,
    camera_id: String,
}

impl AlertPermit<'_> {
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Record the alert as delivered at `now` and release the reservation.
    pub fn commit(self, now: Instant) {
        self.gate.record(&self.camera_id, now);
    }
}

impl Drop for AlertPermit<'_> {
    fn drop(&mut self) {
        self.gate.release(&self.camera_id);
    }
}
