//! Arbitration for dual-master I2C bus selectors, such as the NXP PCA9541 and
//! PCA9641.
//!
//! A master selector connects two upstream bus masters, generally on two
//! independent hosts, to a single downstream bus.  Before every downstream
//! transaction a master has to acquire the downstream bus, and release it once
//! done.  The two hosts know nothing about each other's software - they
//! cooperate only through the selector's registers and wall-clock timeouts.
//!
//! This crate implements one side of that arbitration.  It is `no_std` and
//! transport agnostic: the application provides register access and timing.
//!
//! ## Modules
//!
//! - [`arbiter`] - Arbitration engines, synchronous ([`arbiter::Arbiter`]) and
//!   asynchronous ([`arbiter::AsyncArbiter`])
//! - [`regs`] - Register maps and bit predicates for both chip variants
//! - [`permit`] - Once-only permission to physically release a lock/grant
//!   selector
//!
//! ## Variants
//!
//! Two chip variants are supported behind one interface:
//! - [`arbiter::Variant::SimpleBit`] - PCA9541 style, where ownership and bus
//!   state are toggled bit pairs, and ownership can be forced once the other
//!   master has held the bus for too long.
//! - [`arbiter::Variant::LockRequestGrant`] - PCA9641 style, where a lock is
//!   requested and granted by the chip.
//!
//! The variant is identified once, when binding, by reading register `0x00`.
//!
//! ## Getting Started
//!
//! 1. Implement [`arbiter::RegisterPort`] for your I2C transport.  Each call is a
//!    single byte register read or write, made while the caller already holds
//!    the upstream adapter's lock.
//! 2. Implement [`arbiter::Timer`], or use [`arbiter::StdTimer`] with the `std`
//!    feature.
//! 3. Create the [`arbiter::Arbiter`] with [`arbiter::Arbiter::bind()`].
//! 4. Call [`arbiter::Arbiter::acquire()`] before using the downstream bus and
//!    [`arbiter::Arbiter::release()`] afterwards.
//! 5. If this binding is responsible for releasing a lock/grant selector, claim
//!    a [`permit::ReleasePermit`] from a [`permit::ReleaseGate`] and install it
//!    with [`arbiter::Arbiter::install_permit()`].
//!
//! `acquire()` blocks, polling the chip, for up to 250ms for the bit-toggle
//! variant, and up to 8 rounds of 250ms for the lock/grant variant.
//!
//! ## Features
//!
//! Default features:
//! - `async` - Enable the async engine and traits (requires `alloc`).
//!
//! Optional features:
//! - `std` - Provides [`arbiter::StdTimer`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#![no_std]

#[cfg(feature = "async")]
extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod arbiter;
pub mod permit;
pub mod regs;

#[cfg(test)]
mod sim;

use permit::BindingId;

/// Arbitration errors.
///
/// `E` is the error type of the register transport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Error<E> {
    /// Register read or write failed.  Never retried by this crate.
    Transport(E),
    /// Arbitration did not converge in the retry budget.  The downstream bus
    /// should be treated as unavailable for now.
    TimedOut,
    /// Release permission was already claimed.  `holder` is `None` while the
    /// winning claim is still completing.
    PermitAlreadyClaimed { holder: Option<BindingId> },
    /// Release permit was issued to a different binding
    PermitMismatch {
        expected: BindingId,
        found: BindingId,
    },
    /// Selector only has channel 0
    InvalidChannel(u32),
}

impl<E: core::fmt::Debug> core::fmt::Display for Error<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "register transport error: {e:?}"),
            Error::TimedOut => write!(f, "bus arbitration timed out"),
            Error::PermitAlreadyClaimed {
                holder: Some(holder),
            } => write!(f, "release permission already claimed by binding {holder}"),
            Error::PermitAlreadyClaimed { holder: None } => {
                write!(f, "release permission already claimed")
            }
            Error::PermitMismatch { expected, found } => write!(
                f,
                "release permit belongs to binding {found}, not binding {expected}"
            ),
            Error::InvalidChannel(channel) => write!(f, "invalid channel {channel}"),
        }
    }
}

impl<E: core::fmt::Debug> core::error::Error for Error<E> {}

/// Type to represent the result of an arbitration operation
pub type Result<T, E = core::convert::Infallible> = core::result::Result<T, Error<E>>;
