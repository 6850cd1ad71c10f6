//! Fault injection for the in-memory stores.
//!
//! Every store operation consults a [`FaultSwitch`] before doing anything. A switch
//! can fail the next N calls, fail every call, or stall calls for a while (so a
//! coordinator timeout fires before the operation takes effect).
//!
//! Some operations have a second `*_ack` switch consulted after the change is applied.
//! A failure or stall there models a lost acknowledgement: the caller sees an error or
//! a timeout although the store did the work.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use boxoffice_core::StoreError;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Failure plan for one store operation.
#[derive(Debug, Default)]
pub struct FaultSwitch {
    queued: Mutex<VecDeque<StoreError>>,
    persistent: Mutex<Option<StoreError>>,
    stall: Mutex<Option<Duration>>,
    stall_once: Mutex<VecDeque<Duration>>,
    calls: Mutex<usize>,
}

impl FaultSwitch {
    /// Fail the next call with `error`.
    pub fn fail_next(&self, error: StoreError) {
        self.queued.lock().unwrap().push_back(error);
    }

    /// Fail the next `times` calls with `error`.
    pub fn fail_times(&self, times: usize, error: &StoreError) {
        let mut queued = self.queued.lock().unwrap();
        queued.extend(std::iter::repeat_n(error.clone(), times));
    }

    /// Fail every call with `error` until [`Self::clear`].
    pub fn fail_always(&self, error: StoreError) {
        *self.persistent.lock().unwrap() = Some(error);
    }

    /// Sleep this long before every call takes effect.
    pub fn stall(&self, duration: Duration) {
        *self.stall.lock().unwrap() = Some(duration);
    }

    /// Sleep this long during the next call only.
    pub fn stall_next(&self, duration: Duration) {
        self.stall_once.lock().unwrap().push_back(duration);
    }

    /// Remove every planned failure and stall.
    pub fn clear(&self) {
        self.queued.lock().unwrap().clear();
        *self.persistent.lock().unwrap() = None;
        *self.stall.lock().unwrap() = None;
        self.stall_once.lock().unwrap().clear();
    }

    /// How many times the operation was attempted.
    #[must_use]
    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }

    /// Count the call, wait out a stall, then yield the planned failure if any.
    pub(crate) async fn enter(&self) -> Result<(), StoreError> {
        *self.calls.lock().unwrap() += 1;
        let once = self.stall_once.lock().unwrap().pop_front();
        let stall = once.or(*self.stall.lock().unwrap());
        if let Some(duration) = stall {
            tokio::time::sleep(duration).await;
        }
        if let Some(error) = self.queued.lock().unwrap().pop_front() {
            return Err(error);
        }
        if let Some(error) = self.persistent.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(())
    }
}

/// Shorthand for the error most tests inject.
#[must_use]
pub fn unavailable(reason: &str) -> StoreError {
    StoreError::Unavailable(reason.to_string())
}
