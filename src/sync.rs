//! Interrupt bookkeeping shared between the interrupt handler and the thread driving the
//! controller.
//!
//! The handler ORs freshly acknowledged cause bits into an [`IrqStatus`] accumulator and signals
//! a [`Completion`]; a waiter sleeps on the completion, then takes (and clears) only the bits it
//! asked for. Bits nobody asked for stay in the accumulator for a later waiter.

use std::ops::BitOr;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::platform::{IrqReturn, Platform};
use crate::regs;

/// The three interrupt cause registers, as one value
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct IrqStatus {
    /// INTR_STATUS
    pub status: u32,
    /// TRD_COMP_INT_STATUS, one bit per thread
    pub trd_status: u32,
    /// TRD_ERR_INT_STATUS, one bit per thread
    pub trd_error: u32,
}

impl IrqStatus {
    pub fn is_empty(&self) -> bool {
        self.status == 0 && self.trd_status == 0 && self.trd_error == 0
    }

    /// Does `self` contain any bit of `mask`?
    pub fn intersects(&self, mask: &IrqStatus) -> bool {
        self.status & mask.status != 0
            || self.trd_status & mask.trd_status != 0
            || self.trd_error & mask.trd_error != 0
    }

    fn clear(&mut self, mask: &IrqStatus) {
        self.status &= !mask.status;
        self.trd_status &= !mask.trd_status;
        self.trd_error &= !mask.trd_error;
    }
}

impl BitOr for IrqStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            status: self.status | rhs.status,
            trd_status: self.trd_status | rhs.trd_status,
            trd_error: self.trd_error | rhs.trd_error,
        }
    }
}

/// A counting completion: each `complete()` releases exactly one wait
#[derive(Debug, Default)]
pub struct Completion {
    done: Mutex<u32>,
    cond: Condvar,
}

impl Completion {
    pub fn complete(&self) {
        let mut done = lock(&self.done);
        *done = done.saturating_add(1);
        self.cond.notify_one();
    }

    /// Wait until completed or `timeout` passes; returns whether a completion was consumed
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = lock(&self.done);
        let (mut done, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |done| *done == 0)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *done > 0 {
            *done -= 1;
            true
        } else {
            false
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-controller interrupt state: the accumulator and the completion that guards it
#[derive(Debug, Default)]
pub struct IrqContext {
    pending: Mutex<IrqStatus>,
    complete: Completion,
}

impl IrqContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The interrupt handler body: read the cause registers, acknowledge what was found,
    /// and hand it to whoever is waiting.
    pub fn handle<P: Platform + ?Sized>(&self, hw: &P) -> IrqReturn {
        let mut pending = lock(&self.pending);

        let fired = IrqStatus {
            status: hw.read_reg(regs::INTR_STATUS),
            trd_status: hw.read_reg(regs::TRD_COMP_INT_STATUS),
            trd_error: hw.read_reg(regs::TRD_ERR_INT_STATUS),
        };
        if fired.is_empty() {
            return IrqReturn::None;
        }

        // write-1-to-clear
        hw.write_reg(regs::INTR_STATUS, fired.status);
        hw.write_reg(regs::TRD_COMP_INT_STATUS, fired.trd_status);
        hw.write_reg(regs::TRD_ERR_INT_STATUS, fired.trd_error);

        *pending = *pending | fired;
        self.complete.complete();

        IrqReturn::Handled
    }

    /// Block until an interrupt matching `mask` arrives or `timeout` expires.
    ///
    /// Returns the accumulated status at the time of the match with the masked bits consumed,
    /// or an all-zero status on timeout.
    pub fn wait(&self, mask: &IrqStatus, timeout: Duration) -> IrqStatus {
        let deadline = Instant::now() + timeout;

        loop {
            // a completion may have been left over from an event that arrived before we
            // started waiting, so look at the accumulator first
            {
                let mut pending = lock(&self.pending);
                if pending.intersects(mask) {
                    let snapshot = *pending;
                    pending.clear(mask);
                    return snapshot;
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.complete.wait_timeout(remaining) {
                let pending = lock(&self.pending);
                log::error!(
                    "timeout occurred: status = {:#x}, mask = {:#x}, trd_status = {:#x}, \
                     trd_status mask = {:#x}, trd_error = {:#x}, trd_error mask = {:#x}",
                    pending.status,
                    mask.status,
                    pending.trd_status,
                    mask.trd_status,
                    pending.trd_error,
                    mask.trd_error,
                );
                return IrqStatus::default();
            }
        }
    }

    /// Bits currently accumulated but not yet consumed by any waiter
    pub fn pending(&self) -> IrqStatus {
        *lock(&self.pending)
    }
}

#[cfg(test)]
use std::sync::Arc;

#[test]
fn test_completion_counts() {
    let c = Completion::default();
    c.complete();
    c.complete();
    assert!(c.wait_timeout(Duration::ZERO));
    assert!(c.wait_timeout(Duration::ZERO));
    assert!(!c.wait_timeout(Duration::from_millis(1)));
}

#[cfg(test)]
fn inject(ctx: &IrqContext, status: IrqStatus) {
    let mut pending = lock(&ctx.pending);
    *pending = *pending | status;
    drop(pending);
    ctx.complete.complete();
}

#[test]
fn test_wait_consumes_only_masked_bits() {
    let ctx = IrqContext::new();
    inject(
        &ctx,
        IrqStatus {
            status: regs::INTR_SDMA_TRIGG,
            trd_status: 0b01,
            trd_error: 0,
        },
    );

    let mask = IrqStatus {
        trd_status: 0b01,
        ..Default::default()
    };
    let got = ctx.wait(&mask, Duration::from_secs(1));
    assert_eq!(got.trd_status, 0b01);
    assert_eq!(got.status, regs::INTR_SDMA_TRIGG);

    let left = ctx.pending();
    assert_eq!(left.trd_status, 0);
    assert_eq!(left.status, regs::INTR_SDMA_TRIGG);
}

#[test]
fn test_wait_ignores_foreign_events_then_times_out() {
    let ctx = IrqContext::new();
    inject(
        &ctx,
        IrqStatus {
            trd_status: 0b10,
            ..Default::default()
        },
    );

    let mask = IrqStatus {
        trd_status: 0b01,
        ..Default::default()
    };
    let start = Instant::now();
    let got = ctx.wait(&mask, Duration::from_millis(50));
    let elapsed = start.elapsed();

    assert!(got.is_empty());
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(ctx.pending().trd_status, 0b10);
}

#[test]
fn test_wait_wakes_from_other_thread() {
    let ctx = Arc::new(IrqContext::new());
    let signaller = {
        let ctx = ctx.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            inject(
                &ctx,
                IrqStatus {
                    status: regs::INTR_CDMA_TERR,
                    ..Default::default()
                },
            );
        })
    };

    let mask = IrqStatus {
        status: regs::INTR_CDMA_TERR,
        ..Default::default()
    };
    let got = ctx.wait(&mask, Duration::from_secs(5));
    signaller.join().unwrap();
    assert_eq!(got.status, regs::INTR_CDMA_TERR);
}
