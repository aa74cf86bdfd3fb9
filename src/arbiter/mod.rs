//! Bus arbitration between the two masters of a selector.
//!
//! See [`crate`] for a description of how to use these objects.
//!
//! Arbitration is a poll-with-backoff loop.  Each step re-reads the chip's
//! registers, decides what to write, and either reports the bus as acquired or
//! asks to be retried after a [`RetryDelay`].  Whether this master owns the
//! bus is never cached between steps, as the other master may change it at
//! any time.
//!
//! The decisions made on each step are the pure functions in this module,
//! shared by the blocking engine in [`sync`] and the async engine in
//! [`futures`].
//!
//! Bit-toggle variant (PCA9541):
//!
//! ```text
//! Bus  Ownership  Other master  Action
//! state           requested
//! -----------------------------------------------------------------
//! off  -          yes           wait for force timeout or for the
//!                               other master to drop its request
//! off  no         no            take ownership
//! off  yes        no            turn on bus
//! on   yes        -             done
//! on   no         -             wait for force timeout or for the
//!                               other master to release the bus
//! ```
//!
//! If both masters claim an off bus at the same moment, one turns the bus on
//! believing it owns it while the other requests ownership.  The master that
//! did not own the bus beforehand ends up owning it.
//!
//! Lock/grant variant (PCA9641): request the lock while neither master holds
//! it, connect the bus once the chip grants it, and keep requesting while the
//! other master holds it.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[cfg(feature = "async")]
pub mod futures;
pub mod sync;

#[cfg(feature = "async")]
pub use futures::{AsyncArbiter, AsyncArbitrate, AsyncRegisterPort, AsyncTimer};
#[cfg(feature = "std")]
pub use sync::StdTimer;
pub use sync::{Arbiter, Arbitrate, LockRequestGrant, RegisterPort, SimpleBit, Timer};

use core::time::Duration;

use crate::regs::{grant, simple};
use crate::{Error, Result};

/// Selector protocol personality, identified once when binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// PCA9541 - ownership and bus state as toggled bit pairs
    SimpleBit,
    /// PCA9641 - lock requested from, and granted by, the chip
    LockRequestGrant,
}

impl Variant {
    /// Identify the variant from the value of the [`crate::regs::ID`]
    /// register.
    pub const fn from_id(id: u8) -> Self {
        if id == grant::ID_MAGIC {
            Variant::LockRequestGrant
        } else {
            Variant::SimpleBit
        }
    }

    /// Number of independent give-up rounds `acquire()` runs.
    ///
    /// The lock/grant protocol needs an extra round trip per step, so gets
    /// several rounds.  Always at least one.
    pub fn rounds(&self, config: &ArbiterConfig) -> u8 {
        match self {
            Variant::SimpleBit => 1,
            Variant::LockRequestGrant => config.grant_rounds.max(1),
        }
    }
}

/// Arbitration timing.
///
/// The defaults are hardware timing margins.  Change them only with good
/// reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbiterConfig {
    /// Time after the start of a round when bus ownership is forced
    pub force_timeout: Duration,
    /// Time after the start of a round when the round gives up
    pub give_up_timeout: Duration,
    /// Retry delay after claiming, busy-waited
    pub short_delay: Duration,
    /// Retry delay while the other master holds or wants the bus, slept
    pub long_delay: Duration,
    /// Give-up rounds for the lock/grant variant
    pub grant_rounds: u8,
    /// Release a bit-toggle bus when binding, so the chip starts in a known
    /// state
    pub reset_on_bind: bool,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            force_timeout: Duration::from_millis(125),
            give_up_timeout: Duration::from_millis(250),
            short_delay: Duration::from_micros(50),
            long_delay: Duration::from_micros(1000),
            grant_rounds: 8,
            reset_on_bind: true,
        }
    }
}

/// How long to wait before the next arbitration step.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RetryDelay {
    /// Claim just written, check back quickly
    #[default]
    Short,
    /// Other master owns or wants the bus
    Long,
    /// Lock request was not granted, give the other master extra room
    DoubleLong,
}

impl RetryDelay {
    pub fn duration(&self, config: &ArbiterConfig) -> Duration {
        match self {
            RetryDelay::Short => config.short_delay,
            RetryDelay::Long => config.long_delay,
            RetryDelay::DoubleLong => config.long_delay * 2,
        }
    }

    /// Short delays are busy-waited, everything else sleeps.
    ///
    /// Every pause lasts at least one timer tick.  Sleeps are rounded up to
    /// whole milliseconds, and both saturate rather than wrap.
    pub(crate) fn pause(&self, config: &ArbiterConfig) -> Pause {
        let us = self.duration(config).as_micros();
        match self {
            RetryDelay::Short => Pause::Busy(saturate(us).max(1)),
            _ => Pause::Sleep(saturate(us.div_ceil(1000)).max(1)),
        }
    }
}

fn saturate(value: u128) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pause {
    /// Microseconds
    Busy(u32),
    /// Milliseconds
    Sleep(u32),
}

/// Outcome of a single arbitration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Acquired,
    Retry(RetryDelay),
}

/// Point in time, in microseconds of a [`Timer`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Deadline {
    at_us: u64,
}

impl Deadline {
    pub(crate) fn after(now_us: u64, timeout: Duration) -> Self {
        let timeout_us = u64::try_from(timeout.as_micros()).unwrap_or(u64::MAX);
        Self {
            at_us: now_us.saturating_add(timeout_us),
        }
    }

    /// Deadline is now or in the past
    pub(crate) fn reached(&self, now_us: u64) -> bool {
        now_us >= self.at_us
    }

    /// Deadline is strictly in the past
    pub(crate) fn exceeded(&self, now_us: u64) -> bool {
        now_us > self.at_us
    }
}

/// Downstream bus fault signalled by the chip.  Nothing here attempts
/// recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusFault {
    /// Downstream bus is stuck
    Hung,
    /// Bus initialization sequence failed
    InitFailed,
}

pub(crate) fn bus_fault(sts: u8) -> Option<BusFault> {
    if sts & grant::STS_BUS_HUNG != 0 {
        Some(BusFault::Hung)
    } else if sts & grant::STS_BUS_INIT_FAIL != 0 {
        Some(BusFault::InitFailed)
    } else {
        None
    }
}

pub(crate) fn check_channel<E>(channel: u32) -> Result<(), E> {
    if channel != 0 {
        Err(Error::InvalidChannel(channel))
    } else {
        Ok(())
    }
}

// Bit-toggle decisions

/// What to do after reading the control register of a bit-toggle chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SimpleStep {
    /// Bus is off, status register decides
    ReadStatus,
    /// Bus is on and ours, optionally clear stray bits
    Acquired { cleanup: Option<u8> },
    /// Other master owns the bus
    Foreign { write: Option<u8> },
}

pub(crate) fn simple_on_control(ctl: u8, forced: bool) -> SimpleStep {
    if simple::bus_off(ctl) {
        SimpleStep::ReadStatus
    } else if simple::mine(ctl) {
        let cleanup = (ctl & simple::STRAY != 0).then_some(ctl & !simple::STRAY);
        SimpleStep::Acquired { cleanup }
    } else if forced {
        // Take the bus and reset it
        SimpleStep::Foreign {
            write: Some(simple::claim(ctl) | simple::CTL_BUSINIT | simple::CTL_NTESTON),
        }
    } else if ctl & simple::CTL_NTESTON == 0 {
        // Request ownership
        SimpleStep::Foreign {
            write: Some(ctl | simple::CTL_NTESTON),
        }
    } else {
        SimpleStep::Foreign { write: None }
    }
}

/// Bus is off.  Claim it unless the other master asked for it first, and the
/// force timeout has not yet passed.
pub(crate) fn simple_on_status(ctl: u8, istat: u8, forced: bool) -> (Option<u8>, RetryDelay) {
    if !simple::other_requested(istat) || forced {
        (
            Some(simple::claim(ctl) | simple::CTL_NTESTON),
            RetryDelay::Short,
        )
    } else {
        (None, RetryDelay::Long)
    }
}

/// Value to write to turn the bus off, if it is on and ours.
pub(crate) fn simple_release(ctl: u8) -> Option<u8> {
    (!simple::bus_off(ctl) && simple::mine(ctl)).then_some(simple::bus_off_value(ctl))
}

// Lock/grant decisions

/// What to do after reading the control and status registers of a lock/grant
/// chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GrantStep {
    /// Neither master holds the lock - write this lock request, then re-read
    Request(u8),
    /// We hold the lock - write this to connect the bus, then done
    Held(u8),
    /// Other master holds the lock - write this to signal intent
    Contended(u8),
}

pub(crate) fn grant_on_registers(ctl: u8, sts: u8) -> GrantStep {
    if grant::bus_free(ctl, sts) {
        GrantStep::Request(ctl | grant::CTL_LOCK_REQ)
    } else if grant::lock_grant(ctl) {
        GrantStep::Held(ctl | grant::CTL_BUS_CONNECT | grant::CTL_LOCK_REQ)
    } else {
        GrantStep::Contended(ctl | grant::CTL_LOCK_REQ)
    }
}

/// After requesting the lock, the value which connects the bus if the lock
/// was granted.
pub(crate) fn grant_on_reread(ctl: u8) -> Option<u8> {
    grant::lock_grant(ctl).then_some(ctl | grant::CTL_BUS_CONNECT | grant::CTL_LOCK_REQ)
}
