//! Synchronous, blocking arbitration.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::arbiter::{ArbiterConfig, BusFault, Deadline, GrantStep, Pause, RetryDelay};
use crate::arbiter::{SimpleStep, Step, Variant};
use crate::arbiter::{bus_fault, check_channel, grant_on_registers, grant_on_reread};
use crate::arbiter::{simple_on_control, simple_on_status, simple_release};
use crate::permit::{BindingId, ReleasePermit};
use crate::regs::{self, grant, simple};
use crate::{Error, Result};

/// Single byte register access to the selector chip.
///
/// Each call is one complete bus transaction.  The caller must already hold
/// the upstream adapter's lock, so implementations must not try to take it
/// again.  No retries or timing belong here.
pub trait RegisterPort {
    /// The error type returned by register transactions.
    type Error: core::fmt::Debug;

    /// Read register `reg`.
    fn read(&mut self, reg: u8) -> core::result::Result<u8, Self::Error>;

    /// Write `value` to register `reg`.
    fn write(&mut self, reg: u8, value: u8) -> core::result::Result<(), Self::Error>;
}

impl<P: RegisterPort + ?Sized> RegisterPort for &mut P {
    type Error = P::Error;

    fn read(&mut self, reg: u8) -> core::result::Result<u8, Self::Error> {
        (**self).read(reg)
    }

    fn write(&mut self, reg: u8, value: u8) -> core::result::Result<(), Self::Error> {
        (**self).write(reg, value)
    }
}

/// Time source and delays for the polling loop.
pub trait Timer {
    /// Monotonic time in microseconds.
    fn now_us(&mut self) -> u64;

    /// Busy-wait for `us` microseconds.  Used for the short retry delay only.
    fn delay_us(&mut self, us: u32);

    /// Sleep, allowing other work to run, for `ms` milliseconds.
    fn sleep_ms(&mut self, ms: u32);
}

/// Variant-specific arbitration protocol.
///
/// Implemented by [`SimpleBit`] and [`LockRequestGrant`], and by [`Variant`],
/// which dispatches to one of them.
pub trait Arbitrate {
    /// Run a single arbitration step.  `forced` is set once the force timeout
    /// for this round has passed.
    fn arbitrate<P: RegisterPort>(&self, port: &mut P, forced: bool) -> Result<Step, P::Error>;

    /// Hand the bus back.  `permitted` is whether this binding may release a
    /// gated chip, and is ignored by variants without a release gate.
    fn release<P: RegisterPort>(&self, port: &mut P, permitted: bool) -> Result<(), P::Error>;

    /// Read any downstream bus fault the chip signals.
    fn bus_fault<P: RegisterPort>(&self, port: &mut P) -> Result<Option<BusFault>, P::Error>;
}

/// PCA9541 bit-toggle protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleBit;

impl Arbitrate for SimpleBit {
    fn arbitrate<P: RegisterPort>(&self, port: &mut P, forced: bool) -> Result<Step, P::Error> {
        let ctl = read(port, simple::CONTROL)?;

        match simple_on_control(ctl, forced) {
            SimpleStep::ReadStatus => {
                let istat = read(port, simple::ISTAT)?;
                let (claim, delay) = simple_on_status(ctl, istat, forced);
                if let Some(value) = claim {
                    if forced && simple::other_requested(istat) {
                        warn!("Force timeout passed, claiming bus requested by other master");
                    }
                    write(port, simple::CONTROL, value)?;
                }
                Ok(Step::Retry(delay))
            }
            SimpleStep::Acquired { cleanup } => {
                if let Some(value) = cleanup {
                    write(port, simple::CONTROL, value)?;
                }
                Ok(Step::Acquired)
            }
            SimpleStep::Foreign { write: value } => {
                if let Some(value) = value {
                    if forced {
                        warn!("Force timeout passed, taking bus from other master");
                    }
                    write(port, simple::CONTROL, value)?;
                }
                Ok(Step::Retry(RetryDelay::Long))
            }
        }
    }

    fn release<P: RegisterPort>(&self, port: &mut P, _permitted: bool) -> Result<(), P::Error> {
        let ctl = read(port, simple::CONTROL)?;
        match simple_release(ctl) {
            Some(value) => write(port, simple::CONTROL, value),
            None => {
                trace!("Bus not on and ours, nothing to release");
                Ok(())
            }
        }
    }

    fn bus_fault<P: RegisterPort>(&self, _port: &mut P) -> Result<Option<BusFault>, P::Error> {
        Ok(None)
    }
}

/// PCA9641 lock request/grant protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct LockRequestGrant;

impl Arbitrate for LockRequestGrant {
    fn arbitrate<P: RegisterPort>(&self, port: &mut P, _forced: bool) -> Result<Step, P::Error> {
        let ctl = read(port, grant::CONTROL)?;
        let sts = read(port, grant::STATUS)?;

        match grant_on_registers(ctl, sts) {
            GrantStep::Request(value) => {
                write(port, grant::CONTROL, value)?;
                let ctl = read(port, grant::CONTROL)?;
                match grant_on_reread(ctl) {
                    Some(value) => {
                        write(port, grant::CONTROL, value)?;
                        Ok(Step::Acquired)
                    }
                    None => Ok(Step::Retry(RetryDelay::DoubleLong)),
                }
            }
            GrantStep::Held(value) => {
                write(port, grant::CONTROL, value)?;
                Ok(Step::Acquired)
            }
            GrantStep::Contended(value) => {
                write(port, grant::CONTROL, value)?;
                Ok(Step::Retry(RetryDelay::Long))
            }
        }
    }

    fn release<P: RegisterPort>(&self, port: &mut P, permitted: bool) -> Result<(), P::Error> {
        if permitted {
            write(port, grant::CONTROL, grant::RELEASE)
        } else {
            trace!("Binding not permitted to release lock");
            Ok(())
        }
    }

    fn bus_fault<P: RegisterPort>(&self, port: &mut P) -> Result<Option<BusFault>, P::Error> {
        let sts = read(port, grant::STATUS)?;
        Ok(bus_fault(sts))
    }
}

impl Arbitrate for Variant {
    fn arbitrate<P: RegisterPort>(&self, port: &mut P, forced: bool) -> Result<Step, P::Error> {
        match self {
            Variant::SimpleBit => SimpleBit.arbitrate(port, forced),
            Variant::LockRequestGrant => LockRequestGrant.arbitrate(port, forced),
        }
    }

    fn release<P: RegisterPort>(&self, port: &mut P, permitted: bool) -> Result<(), P::Error> {
        match self {
            Variant::SimpleBit => SimpleBit.release(port, permitted),
            Variant::LockRequestGrant => LockRequestGrant.release(port, permitted),
        }
    }

    fn bus_fault<P: RegisterPort>(&self, port: &mut P) -> Result<Option<BusFault>, P::Error> {
        match self {
            Variant::SimpleBit => SimpleBit.bus_fault(port),
            Variant::LockRequestGrant => LockRequestGrant.bus_fault(port),
        }
    }
}

/// Blocking arbiter for one selector chip, owned by one local binding.
///
/// Only one `Arbiter` may exist per physical chip per host.  Calls must be
/// serialized by the caller, which must also hold the upstream adapter's
/// lock while calling.
///
/// Example usage:
///
/// ```rust,ignore
/// use master_selector::arbiter::{Arbiter, ArbiterConfig};
/// use master_selector::permit::BindingId;
///
/// let mut arbiter = Arbiter::bind(port, timer, BindingId(1), ArbiterConfig::default())?;
/// arbiter.acquire(0)?;
/// // Use the downstream bus...
/// arbiter.release(0)?;
/// ```
pub struct Arbiter<P: RegisterPort, T: Timer> {
    port: P,
    timer: T,
    id: BindingId,
    variant: Variant,
    config: ArbiterConfig,
    permit: Option<ReleasePermit>,
    delay: RetryDelay,
    force_at: Deadline,
}

impl<P: RegisterPort, T: Timer> Arbiter<P, T> {
    /// Bind to a selector chip, identifying its variant.
    ///
    /// Unless disabled by [`ArbiterConfig::reset_on_bind`], releases a
    /// bit-toggle bus once so the chip starts in a known state.  A lock/grant
    /// chip is left alone, as no binding holds a [`ReleasePermit`] yet.
    ///
    /// Arguments:
    /// - `port` - Register access to the chip
    /// - `timer` - Time source for the polling loop
    /// - `id` - Identifier of this binding, matched against any
    ///   [`ReleasePermit`] later installed
    /// - `config` - Arbitration timing
    pub fn bind(
        mut port: P,
        timer: T,
        id: BindingId,
        config: ArbiterConfig,
    ) -> Result<Self, P::Error> {
        let variant = Variant::from_id(read(&mut port, regs::ID)?);

        if config.reset_on_bind {
            variant.release(&mut port, false)?;
        }

        info!("Registered {variant:?} master selector for binding {id}");

        Ok(Self::with_variant(port, timer, id, variant, config))
    }

    /// Create an arbiter for a chip whose variant is already known.  No
    /// register access is performed.
    pub fn with_variant(
        port: P,
        timer: T,
        id: BindingId,
        variant: Variant,
        config: ArbiterConfig,
    ) -> Self {
        Self {
            port,
            timer,
            id,
            variant,
            config,
            permit: None,
            delay: RetryDelay::default(),
            force_at: Deadline::default(),
        }
    }

    /// Install the permission to physically release a lock/grant chip.
    ///
    /// Fails with [`Error::PermitMismatch`] if the permit was claimed for a
    /// different binding.
    pub fn install_permit(&mut self, permit: ReleasePermit) -> Result<(), P::Error> {
        if permit.holder() != self.id {
            return Err(Error::PermitMismatch {
                expected: self.id,
                found: permit.holder(),
            });
        }
        debug!("Binding {} may release the bus", self.id);
        self.permit = Some(permit);
        Ok(())
    }

    /// Acquire exclusive use of the downstream bus.
    ///
    /// Safe to call while already owning the bus, returning quickly.  Blocks
    /// for up to the give-up timeout per round, and fails with
    /// [`Error::TimedOut`] once every round is exhausted.  Any register error
    /// is returned immediately.
    pub fn acquire(&mut self, channel: u32) -> Result<(), P::Error> {
        check_channel(channel)?;

        let rounds = self.variant.rounds(&self.config);
        for round in 1..=rounds {
            let now = self.timer.now_us();
            let give_up = Deadline::after(now, self.config.give_up_timeout);
            self.force_at = Deadline::after(now, self.config.force_timeout);

            loop {
                let forced = self.force_at.reached(self.timer.now_us());
                match self.variant.arbitrate(&mut self.port, forced)? {
                    Step::Acquired => {
                        debug!("Bus acquired in round {round}/{rounds}");
                        return Ok(());
                    }
                    Step::Retry(delay) => self.delay = delay,
                }

                self.pause();

                if give_up.exceeded(self.timer.now_us()) {
                    break;
                }
            }

            debug!("Arbitration round {round}/{rounds} gave up");
        }

        warn!("Bus arbitration timed out after {rounds} round(s)");
        Err(Error::TimedOut)
    }

    /// Release the downstream bus.
    ///
    /// For the lock/grant variant this only touches the chip if a
    /// [`ReleasePermit`] has been installed.
    pub fn release(&mut self, channel: u32) -> Result<(), P::Error> {
        check_channel(channel)?;
        self.variant.release(&mut self.port, self.permit.is_some())
    }

    /// Read any downstream bus fault signalled by the chip.
    pub fn bus_fault(&mut self) -> Result<Option<BusFault>, P::Error> {
        self.variant.bus_fault(&mut self.port)
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn id(&self) -> BindingId {
        self.id
    }

    /// Whether this binding may physically release a gated chip.
    pub fn may_release(&self) -> bool {
        self.permit.is_some()
    }

    /// Unbind, returning the port and timer.
    pub fn into_parts(self) -> (P, T) {
        (self.port, self.timer)
    }
}

// Internal functions
impl<P: RegisterPort, T: Timer> Arbiter<P, T> {
    fn pause(&mut self) {
        match self.delay.pause(&self.config) {
            Pause::Busy(us) => self.timer.delay_us(us),
            Pause::Sleep(ms) => self.timer.sleep_ms(ms),
        }
    }
}

fn read<P: RegisterPort>(port: &mut P, reg: u8) -> Result<u8, P::Error> {
    match port.read(reg) {
        Ok(value) => {
            trace!("Read {reg:#04X}: {value:#04X}");
            Ok(value)
        }
        Err(e) => {
            debug!("Read {reg:#04X} failed: {e:?}");
            Err(Error::Transport(e))
        }
    }
}

fn write<P: RegisterPort>(port: &mut P, reg: u8, value: u8) -> Result<(), P::Error> {
    match port.write(reg, value) {
        Ok(()) => {
            trace!("Wrote {reg:#04X}: {value:#04X}");
            Ok(())
        }
        Err(e) => {
            debug!("Write {reg:#04X} failed: {e:?}");
            Err(Error::Transport(e))
        }
    }
}

/// [`Timer`] using `std::time` and `std::thread`.
///
/// Short delays spin, as sleeping for tens of microseconds overshoots badly on
/// most hosts.
#[cfg(feature = "std")]
#[derive(Debug, Clone, Copy)]
pub struct StdTimer {
    start: std::time::Instant,
}

#[cfg(feature = "std")]
impl StdTimer {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for StdTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Timer for StdTimer {
    fn now_us(&mut self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn delay_us(&mut self, us: u32) {
        let until = std::time::Instant::now() + core::time::Duration::from_micros(us as u64);
        while std::time::Instant::now() < until {
            core::hint::spin_loop();
        }
    }

    fn sleep_ms(&mut self, ms: u32) {
        std::thread::sleep(core::time::Duration::from_millis(ms as u64));
    }
}
