//! Asynchronous arbitration - for hosts running an async executor.
//!
//! Semantics are identical to [`crate::arbiter::Arbiter`], with register
//! access and delays awaited rather than blocking.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::boxed::Box;
use async_trait::async_trait;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::arbiter::{ArbiterConfig, BusFault, Deadline, GrantStep, Pause, RetryDelay};
use crate::arbiter::{LockRequestGrant, SimpleBit, SimpleStep, Step, Variant};
use crate::arbiter::{bus_fault, check_channel, grant_on_registers, grant_on_reread};
use crate::arbiter::{simple_on_control, simple_on_status, simple_release};
use crate::permit::{BindingId, ReleasePermit};
use crate::regs::{self, grant, simple};
use crate::{Error, Result};

/// Single byte register access to the selector chip.
///
/// Async version of [`crate::arbiter::RegisterPort`], with the same
/// requirements.
#[async_trait(?Send)]
pub trait AsyncRegisterPort {
    /// The error type returned by register transactions.
    type Error: core::fmt::Debug;

    /// Read register `reg`.
    async fn read(&mut self, reg: u8) -> core::result::Result<u8, Self::Error>;

    /// Write `value` to register `reg`.
    async fn write(&mut self, reg: u8, value: u8) -> core::result::Result<(), Self::Error>;
}

/// Time source and delays for the async polling loop.
///
/// Keeps this crate free of any specific async runtime.  Example, using
/// embassy:
///
/// ```rust,ignore
/// use embassy_time::{Duration, Instant, Timer};
/// struct EmbassyTimer;
/// #[async_trait(?Send)]
/// impl AsyncTimer for EmbassyTimer {
///     fn now_us(&mut self) -> u64 {
///         Instant::now().as_micros()
///     }
///     async fn delay_us(&mut self, us: u32) {
///         Timer::after(Duration::from_micros(us as u64)).await;
///     }
///     async fn sleep_ms(&mut self, ms: u32) {
///         Timer::after(Duration::from_millis(ms as u64)).await;
///     }
/// }
/// ```
#[async_trait(?Send)]
pub trait AsyncTimer {
    /// Monotonic time in microseconds.
    fn now_us(&mut self) -> u64;

    /// Wait for `us` microseconds.  Used for the short retry delay only.
    async fn delay_us(&mut self, us: u32);

    /// Wait for `ms` milliseconds.
    async fn sleep_ms(&mut self, ms: u32);
}

/// Variant-specific arbitration protocol, async version of
/// [`crate::arbiter::Arbitrate`].
#[async_trait(?Send)]
pub trait AsyncArbitrate {
    async fn arbitrate<P: AsyncRegisterPort>(
        &self,
        port: &mut P,
        forced: bool,
    ) -> Result<Step, P::Error>;

    async fn release<P: AsyncRegisterPort>(
        &self,
        port: &mut P,
        permitted: bool,
    ) -> Result<(), P::Error>;

    async fn bus_fault<P: AsyncRegisterPort>(
        &self,
        port: &mut P,
    ) -> Result<Option<BusFault>, P::Error>;
}

#[async_trait(?Send)]
impl AsyncArbitrate for SimpleBit {
    async fn arbitrate<P: AsyncRegisterPort>(
        &self,
        port: &mut P,
        forced: bool,
    ) -> Result<Step, P::Error> {
        let ctl = read(port, simple::CONTROL).await?;

        match simple_on_control(ctl, forced) {
            SimpleStep::ReadStatus => {
                let istat = read(port, simple::ISTAT).await?;
                let (claim, delay) = simple_on_status(ctl, istat, forced);
                if let Some(value) = claim {
                    if forced && simple::other_requested(istat) {
                        warn!("Force timeout passed, claiming bus requested by other master");
                    }
                    write(port, simple::CONTROL, value).await?;
                }
                Ok(Step::Retry(delay))
            }
            SimpleStep::Acquired { cleanup } => {
                if let Some(value) = cleanup {
                    write(port, simple::CONTROL, value).await?;
                }
                Ok(Step::Acquired)
            }
            SimpleStep::Foreign { write: value } => {
                if let Some(value) = value {
                    if forced {
                        warn!("Force timeout passed, taking bus from other master");
                    }
                    write(port, simple::CONTROL, value).await?;
                }
                Ok(Step::Retry(RetryDelay::Long))
            }
        }
    }

    async fn release<P: AsyncRegisterPort>(
        &self,
        port: &mut P,
        _permitted: bool,
    ) -> Result<(), P::Error> {
        let ctl = read(port, simple::CONTROL).await?;
        match simple_release(ctl) {
            Some(value) => write(port, simple::CONTROL, value).await,
            None => {
                trace!("Bus not on and ours, nothing to release");
                Ok(())
            }
        }
    }

    async fn bus_fault<P: AsyncRegisterPort>(
        &self,
        _port: &mut P,
    ) -> Result<Option<BusFault>, P::Error> {
        Ok(None)
    }
}

#[async_trait(?Send)]
impl AsyncArbitrate for LockRequestGrant {
    async fn arbitrate<P: AsyncRegisterPort>(
        &self,
        port: &mut P,
        _forced: bool,
    ) -> Result<Step, P::Error> {
        let ctl = read(port, grant::CONTROL).await?;
        let sts = read(port, grant::STATUS).await?;

        match grant_on_registers(ctl, sts) {
            GrantStep::Request(value) => {
                write(port, grant::CONTROL, value).await?;
                let ctl = read(port, grant::CONTROL).await?;
                match grant_on_reread(ctl) {
                    Some(value) => {
                        write(port, grant::CONTROL, value).await?;
                        Ok(Step::Acquired)
                    }
                    None => Ok(Step::Retry(RetryDelay::DoubleLong)),
                }
            }
            GrantStep::Held(value) => {
                write(port, grant::CONTROL, value).await?;
                Ok(Step::Acquired)
            }
            GrantStep::Contended(value) => {
                write(port, grant::CONTROL, value).await?;
                Ok(Step::Retry(RetryDelay::Long))
            }
        }
    }

    async fn release<P: AsyncRegisterPort>(
        &self,
        port: &mut P,
        permitted: bool,
    ) -> Result<(), P::Error> {
        if permitted {
            write(port, grant::CONTROL, grant::RELEASE).await
        } else {
            trace!("Binding not permitted to release lock");
            Ok(())
        }
    }

    async fn bus_fault<P: AsyncRegisterPort>(
        &self,
        port: &mut P,
    ) -> Result<Option<BusFault>, P::Error> {
        let sts = read(port, grant::STATUS).await?;
        Ok(bus_fault(sts))
    }
}

#[async_trait(?Send)]
impl AsyncArbitrate for Variant {
    async fn arbitrate<P: AsyncRegisterPort>(
        &self,
        port: &mut P,
        forced: bool,
    ) -> Result<Step, P::Error> {
        match self {
            Variant::SimpleBit => AsyncArbitrate::arbitrate(&SimpleBit, port, forced).await,
            Variant::LockRequestGrant => {
                AsyncArbitrate::arbitrate(&LockRequestGrant, port, forced).await
            }
        }
    }

    async fn release<P: AsyncRegisterPort>(
        &self,
        port: &mut P,
        permitted: bool,
    ) -> Result<(), P::Error> {
        match self {
            Variant::SimpleBit => AsyncArbitrate::release(&SimpleBit, port, permitted).await,
            Variant::LockRequestGrant => {
                AsyncArbitrate::release(&LockRequestGrant, port, permitted).await
            }
        }
    }

    async fn bus_fault<P: AsyncRegisterPort>(
        &self,
        port: &mut P,
    ) -> Result<Option<BusFault>, P::Error> {
        match self {
            Variant::SimpleBit => AsyncArbitrate::bus_fault(&SimpleBit, port).await,
            Variant::LockRequestGrant => AsyncArbitrate::bus_fault(&LockRequestGrant, port).await,
        }
    }
}

/// Async arbiter for one selector chip, owned by one local binding.
///
/// See [`crate::arbiter::Arbiter`] for the rules on bindings and calling.
///
/// Example usage:
///
/// ```rust,ignore
/// use master_selector::arbiter::{ArbiterConfig, AsyncArbiter};
/// use master_selector::permit::BindingId;
///
/// let config = ArbiterConfig::default();
/// let mut arbiter = AsyncArbiter::bind(port, timer, BindingId(1), config).await?;
/// arbiter.acquire(0).await?;
/// // Use the downstream bus...
/// arbiter.release(0).await?;
/// ```
pub struct AsyncArbiter<P: AsyncRegisterPort, T: AsyncTimer> {
    port: P,
    timer: T,
    id: BindingId,
    variant: Variant,
    config: ArbiterConfig,
    permit: Option<ReleasePermit>,
    delay: RetryDelay,
    force_at: Deadline,
}

impl<P: AsyncRegisterPort, T: AsyncTimer> AsyncArbiter<P, T> {
    /// Bind to a selector chip, identifying its variant.
    ///
    /// Unless disabled by [`ArbiterConfig::reset_on_bind`], releases a
    /// bit-toggle bus once so the chip starts in a known state.  A lock/grant
    /// chip is left alone, as no binding holds a [`ReleasePermit`] yet.
    pub async fn bind(
        mut port: P,
        timer: T,
        id: BindingId,
        config: ArbiterConfig,
    ) -> Result<Self, P::Error> {
        let variant = Variant::from_id(read(&mut port, regs::ID).await?);

        if config.reset_on_bind {
            AsyncArbitrate::release(&variant, &mut port, false).await?;
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
    /// Not cancel safe.  Dropping the future part way through may leave a
    /// claim or lock request written to the chip.
    pub async fn acquire(&mut self, channel: u32) -> Result<(), P::Error> {
        check_channel(channel)?;

        let rounds = self.variant.rounds(&self.config);
        for round in 1..=rounds {
            let now = self.timer.now_us();
            let give_up = Deadline::after(now, self.config.give_up_timeout);
            self.force_at = Deadline::after(now, self.config.force_timeout);

            loop {
                let forced = self.force_at.reached(self.timer.now_us());
                match AsyncArbitrate::arbitrate(&self.variant, &mut self.port, forced).await? {
                    Step::Acquired => {
                        debug!("Bus acquired in round {round}/{rounds}");
                        return Ok(());
                    }
                    Step::Retry(delay) => self.delay = delay,
                }

                self.pause().await;

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
    pub async fn release(&mut self, channel: u32) -> Result<(), P::Error> {
        check_channel(channel)?;
        let permitted = self.permit.is_some();
        AsyncArbitrate::release(&self.variant, &mut self.port, permitted).await
    }

    /// Read any downstream bus fault signalled by the chip.
    pub async fn bus_fault(&mut self) -> Result<Option<BusFault>, P::Error> {
        AsyncArbitrate::bus_fault(&self.variant, &mut self.port).await
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
impl<P: AsyncRegisterPort, T: AsyncTimer> AsyncArbiter<P, T> {
    async fn pause(&mut self) {
        match self.delay.pause(&self.config) {
            Pause::Busy(us) => self.timer.delay_us(us).await,
            Pause::Sleep(ms) => self.timer.sleep_ms(ms).await,
        }
    }
}

async fn read<P: AsyncRegisterPort>(port: &mut P, reg: u8) -> Result<u8, P::Error> {
    match port.read(reg).await {
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

async fn write<P: AsyncRegisterPort>(port: &mut P, reg: u8, value: u8) -> Result<(), P::Error> {
    match port.write(reg, value).await {
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
