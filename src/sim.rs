//! Behavioural models of both selector variants, with a virtual clock, for
//! tests.
//!
//! Time only passes when a [`FakeTimer`] is asked to wait, so timing
//! assertions are exact and tests run instantly.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[cfg(feature = "async")]
use std::boxed::Box;
use std::cell::Cell;
use std::rc::Rc;
use std::vec::Vec;

#[cfg(feature = "async")]
use async_trait::async_trait;

#[cfg(feature = "async")]
use crate::arbiter::{AsyncRegisterPort, AsyncTimer};
use crate::arbiter::{RegisterPort, Timer};
use crate::regs::{self, grant, simple};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimError {
    /// Transaction with this index was not acknowledged
    Nak(usize),
}

/// Transaction log and fault injection, shared by both chip models.
#[derive(Debug, Default)]
pub struct Transactions {
    /// Every attempted transaction, including failed ones
    pub count: usize,
    /// Fail the transaction with this index
    pub fail_at: Option<usize>,
    /// Registers successfully read
    pub reads: Vec<u8>,
    /// Successful writes
    pub writes: Vec<(u8, u8)>,
}

impl Transactions {
    fn begin(&mut self) -> Result<(), SimError> {
        let index = self.count;
        self.count += 1;
        if self.fail_at == Some(index) {
            Err(SimError::Nak(index))
        } else {
            Ok(())
        }
    }
}

/// Virtual monotonic clock, in microseconds.
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    now: Rc<Cell<u64>>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> u64 {
        self.now.get()
    }

    pub fn timer(&self) -> FakeTimer {
        FakeTimer {
            now: self.now.clone(),
            busy_waits: Vec::new(),
            sleeps: Vec::new(),
        }
    }
}

/// Timer which advances its [`VirtualClock`] instead of waiting.
#[derive(Debug)]
pub struct FakeTimer {
    now: Rc<Cell<u64>>,
    /// Every busy-wait, in microseconds
    pub busy_waits: Vec<u32>,
    /// Every sleep, in milliseconds
    pub sleeps: Vec<u32>,
}

impl Timer for FakeTimer {
    fn now_us(&mut self) -> u64 {
        self.now.get()
    }

    fn delay_us(&mut self, us: u32) {
        self.busy_waits.push(us);
        self.now.set(self.now.get() + us as u64);
    }

    fn sleep_ms(&mut self, ms: u32) {
        self.sleeps.push(ms);
        self.now.set(self.now.get() + ms as u64 * 1000);
    }
}

/// Behaviour of the other master on a bit-toggle chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    /// Never wants the bus
    Idle,
    /// Keeps its test request asserted, but never claims
    Requesting,
    /// Owns the bus, and takes it straight back after every write we make
    Stubborn,
    /// Owns the bus like [`Peer::Stubborn`], but goes idle once we force a
    /// bus reset
    Yielding,
}

/// PCA9541 model, seen from this master.
///
/// This master's half of each bit pair is whatever it last wrote.  The other
/// master's half is the `n*` fields.
#[derive(Debug)]
pub struct SimpleChip {
    pub mybus: bool,
    pub nmybus: bool,
    pub buson: bool,
    pub nbuson: bool,
    pub businit: bool,
    pub nteston: bool,
    peer: Peer,
    pub io: Transactions,
}

impl SimpleChip {
    /// Bus off, owned by this master.  A stubborn or yielding peer starts
    /// owning an on bus.
    pub fn new(peer: Peer) -> Self {
        let stubborn = matches!(peer, Peer::Stubborn | Peer::Yielding);
        Self {
            mybus: false,
            nmybus: stubborn,
            buson: false,
            nbuson: stubborn,
            businit: false,
            nteston: false,
            peer,
            io: Transactions::default(),
        }
    }

    pub fn control(&mut self) -> u8 {
        let mut ctl = 0;
        ctl |= bit(self.mybus, simple::CTL_MYBUS);
        ctl |= bit(self.nmybus, simple::CTL_NMYBUS);
        ctl |= bit(self.buson, simple::CTL_BUSON);
        ctl |= bit(self.nbuson, simple::CTL_NBUSON);
        ctl |= bit(self.businit, simple::CTL_BUSINIT);
        ctl |= bit(self.nteston, simple::CTL_NTESTON);
        ctl
    }

    fn istat(&self) -> u8 {
        bit(self.peer == Peer::Requesting, simple::ISTAT_NMYTEST)
    }

    fn write_control(&mut self, value: u8) {
        self.mybus = value & simple::CTL_MYBUS != 0;
        self.buson = value & simple::CTL_BUSON != 0;
        self.businit = value & simple::CTL_BUSINIT != 0;
        self.nteston = value & simple::CTL_NTESTON != 0;

        if self.peer == Peer::Yielding && self.businit {
            self.peer = Peer::Idle;
        }

        if matches!(self.peer, Peer::Stubborn | Peer::Yielding) {
            // Other master owns, bus on
            self.nmybus = !self.mybus;
            self.nbuson = !self.buson;
        }
    }
}

impl RegisterPort for SimpleChip {
    type Error = SimError;

    fn read(&mut self, reg: u8) -> Result<u8, SimError> {
        self.io.begin()?;
        self.io.reads.push(reg);
        Ok(match reg {
            simple::CONTROL => self.control(),
            simple::ISTAT => self.istat(),
            _ => 0,
        })
    }

    fn write(&mut self, reg: u8, value: u8) -> Result<(), SimError> {
        self.io.begin()?;
        self.io.writes.push((reg, value));
        if reg == simple::CONTROL {
            self.write_control(value);
        }
        Ok(())
    }
}

/// PCA9641 model, seen from this master.
///
/// A pending lock request is granted as soon as the other master holds no
/// lock.  The other master can be made to hold the lock until a point in
/// virtual time.
#[derive(Debug)]
pub struct GrantChip {
    now: Rc<Cell<u64>>,
    ctl: u8,
    grant: bool,
    peer_lock: bool,
    peer_release_at: Option<u64>,
    /// Extra status bits to report
    pub status_extra: u8,
    pub io: Transactions,
}

impl GrantChip {
    pub fn new(clock: &VirtualClock) -> Self {
        Self {
            now: clock.now.clone(),
            ctl: 0,
            grant: false,
            peer_lock: false,
            peer_release_at: None,
            status_extra: 0,
            io: Transactions::default(),
        }
    }

    /// Other master holds the lock until `release_at`, or forever.
    pub fn held_by_peer(clock: &VirtualClock, release_at: Option<u64>) -> Self {
        Self {
            peer_lock: true,
            peer_release_at: release_at,
            ..Self::new(clock)
        }
    }

    fn refresh(&mut self) {
        if let Some(at) = self.peer_release_at {
            if self.now.get() >= at {
                self.peer_lock = false;
                self.peer_release_at = None;
            }
        }
        if self.ctl & grant::CTL_LOCK_REQ != 0 && !self.peer_lock {
            self.grant = true;
        }
    }

    pub fn control(&mut self) -> u8 {
        self.refresh();
        if self.grant {
            self.ctl | grant::CTL_LOCK_GRANT
        } else {
            self.ctl & !grant::CTL_BUS_CONNECT
        }
    }

    fn status(&mut self) -> u8 {
        self.refresh();
        self.status_extra | bit(self.peer_lock && !self.grant, grant::STS_OTHER_LOCK)
    }

    fn write_control(&mut self, value: u8) {
        self.ctl = value & !grant::CTL_LOCK_GRANT;
        if value & grant::CTL_LOCK_REQ == 0 {
            self.grant = false;
        }
        self.refresh();
    }
}

impl RegisterPort for GrantChip {
    type Error = SimError;

    fn read(&mut self, reg: u8) -> Result<u8, SimError> {
        self.io.begin()?;
        self.io.reads.push(reg);
        Ok(match reg {
            regs::ID => grant::ID_MAGIC,
            grant::CONTROL => self.control(),
            grant::STATUS => self.status(),
            _ => 0,
        })
    }

    fn write(&mut self, reg: u8, value: u8) -> Result<(), SimError> {
        self.io.begin()?;
        self.io.writes.push((reg, value));
        if reg == grant::CONTROL {
            self.write_control(value);
        }
        Ok(())
    }
}

fn bit(set: bool, mask: u8) -> u8 {
    if set { mask } else { 0 }
}

#[cfg(feature = "async")]
#[async_trait(?Send)]
impl AsyncRegisterPort for SimpleChip {
    type Error = SimError;

    async fn read(&mut self, reg: u8) -> Result<u8, SimError> {
        RegisterPort::read(self, reg)
    }

    async fn write(&mut self, reg: u8, value: u8) -> Result<(), SimError> {
        RegisterPort::write(self, reg, value)
    }
}

#[cfg(feature = "async")]
#[async_trait(?Send)]
impl AsyncRegisterPort for GrantChip {
    type Error = SimError;

    async fn read(&mut self, reg: u8) -> Result<u8, SimError> {
        RegisterPort::read(self, reg)
    }

    async fn write(&mut self, reg: u8, value: u8) -> Result<(), SimError> {
        RegisterPort::write(self, reg, value)
    }
}

#[cfg(feature = "async")]
#[async_trait(?Send)]
impl AsyncTimer for FakeTimer {
    fn now_us(&mut self) -> u64 {
        Timer::now_us(self)
    }

    async fn delay_us(&mut self, us: u32) {
        Timer::delay_us(self, us)
    }

    async fn sleep_ms(&mut self, ms: u32) {
        Timer::sleep_ms(self, ms)
    }
}

/// Drive a future to completion.  Every future in these models is ready on
/// first poll, so no real waker is needed.
#[cfg(feature = "async")]
pub fn block_on<F: core::future::Future>(future: F) -> F::Output {
    let mut future = core::pin::pin!(future);
    let mut cx = core::task::Context::from_waker(core::task::Waker::noop());
    loop {
        if let core::task::Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return output;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stubborn_peer_takes_bus_back() {
        let mut chip = SimpleChip::new(Peer::Stubborn);
        assert!(!simple::mine(chip.control()));

        let claim = simple::claim(chip.control());
        RegisterPort::write(&mut chip, simple::CONTROL, claim).unwrap();

        let ctl = chip.control();
        assert!(!simple::mine(ctl));
        assert!(!simple::bus_off(ctl));
    }

    #[test]
    fn yielding_peer_gives_up_on_bus_reset() {
        let mut chip = SimpleChip::new(Peer::Yielding);
        let ctl = chip.control();
        RegisterPort::write(&mut chip, simple::CONTROL, ctl | simple::CTL_NTESTON).unwrap();
        assert!(!simple::mine(chip.control()));

        let force = simple::claim(ctl) | simple::CTL_BUSINIT | simple::CTL_NTESTON;
        RegisterPort::write(&mut chip, simple::CONTROL, force).unwrap();
        let ctl = chip.control();
        assert!(simple::mine(ctl));
        assert!(!simple::bus_off(ctl));
    }

    #[test]
    fn grant_follows_other_lock() {
        let clock = VirtualClock::new();
        let mut chip = GrantChip::held_by_peer(&clock, Some(1_000));

        RegisterPort::write(&mut chip, grant::CONTROL, grant::CTL_LOCK_REQ).unwrap();
        assert!(!grant::lock_grant(chip.control()));
        assert!(grant::other_lock(chip.status()));

        Timer::sleep_ms(&mut clock.timer(), 1);
        assert!(grant::lock_grant(chip.control()));
        assert!(!grant::other_lock(chip.status()));
    }

    #[test]
    fn faults_are_injected_once() {
        let mut chip = SimpleChip::new(Peer::Idle);
        chip.io.fail_at = Some(1);

        assert!(RegisterPort::read(&mut chip, simple::CONTROL).is_ok());
        assert_eq!(
            RegisterPort::read(&mut chip, simple::CONTROL),
            Err(SimError::Nak(1))
        );
        assert!(RegisterPort::read(&mut chip, simple::CONTROL).is_ok());
        assert_eq!(chip.io.count, 3);
        assert_eq!(chip.io.reads.len(), 2);
    }
}
