//! Register maps for the two supported master selector variants.
//!
//! Both chips expose single byte registers at indices `0x00`-`0x03`, with
//! overlapping addresses but different bit meanings.  All values here are
//! read live from the chip on every arbitration step - nothing in this module
//! holds state.
//!
//! # Bit-toggle variant (PCA9541)
//!
//! Ownership and bus state are each encoded as a pair of bits: one written by
//! this master (`MYBUS`, `BUSON`) and one reflecting the other master
//! (`NMYBUS`, `NBUSON`).
//!
//! - This master owns the bus when `MYBUS` and `NMYBUS` are equal.
//! - The downstream bus is on when `BUSON` and `NBUSON` differ.
//!
//! # Lock/grant variant (PCA9641)
//!
//! This master sets `LOCK_REQ`, and the chip answers with `LOCK_GRANT` once
//! the other master has no lock.  `BUS_CONNECT` then connects the downstream
//! bus.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

/// Identity register, common to both variants.  Only the lock/grant variant
/// reads back [`grant::ID_MAGIC`].
pub const ID: u8 = 0x00;

/// PCA9541 register map.
pub mod simple {
    pub const CONTROL: u8 = 0x01;
    pub const ISTAT: u8 = 0x02;

    pub const CTL_MYBUS: u8 = 1 << 0;
    pub const CTL_NMYBUS: u8 = 1 << 1;
    pub const CTL_BUSON: u8 = 1 << 2;
    pub const CTL_NBUSON: u8 = 1 << 3;
    pub const CTL_BUSINIT: u8 = 1 << 4;
    pub const CTL_TESTON: u8 = 1 << 6;
    pub const CTL_NTESTON: u8 = 1 << 7;

    pub const ISTAT_INTIN: u8 = 1 << 0;
    pub const ISTAT_BUSINIT: u8 = 1 << 1;
    pub const ISTAT_BUSOK: u8 = 1 << 2;
    pub const ISTAT_BUSLOST: u8 = 1 << 3;
    pub const ISTAT_MYTEST: u8 = 1 << 6;
    pub const ISTAT_NMYTEST: u8 = 1 << 7;

    /// Bus on/off bit pair
    pub const BUSON: u8 = CTL_BUSON | CTL_NBUSON;
    /// Ownership bit pair
    pub const MYBUS: u8 = CTL_MYBUS | CTL_NMYBUS;

    /// Bits which must not be left set once the bus is ours.
    pub const STRAY: u8 = CTL_NTESTON | CTL_BUSINIT;

    /// Control commands per the PCA9541 datasheet, indexed by the low nibble
    /// of the control register.  Each entry is the `MYBUS`/`BUSON` pair to
    /// write to move one step towards "bus on, owned by us".
    pub const CLAIM_TABLE: [u8; 16] = [4, 0, 1, 5, 4, 4, 5, 5, 0, 0, 1, 1, 0, 4, 5, 1];

    /// Bus is off - `BUSON` and `NBUSON` are both clear or both set.
    pub const fn bus_off(ctl: u8) -> bool {
        let bits = ctl & BUSON;
        bits == 0 || bits == BUSON
    }

    /// This master owns the bus - `MYBUS` and `NMYBUS` are both clear or both
    /// set.
    pub const fn mine(ctl: u8) -> bool {
        let bits = ctl & MYBUS;
        bits == 0 || bits == MYBUS
    }

    /// Other master has signalled it wants the bus.
    pub const fn other_requested(istat: u8) -> bool {
        istat & ISTAT_NMYTEST != 0
    }

    /// Next claim bits for the given control register value.
    pub const fn claim(ctl: u8) -> u8 {
        CLAIM_TABLE[(ctl & 0x0f) as usize]
    }

    /// Value which turns the bus off, by matching `BUSON` to `NBUSON`.
    pub const fn bus_off_value(ctl: u8) -> u8 {
        (ctl & CTL_NBUSON) >> 1
    }
}

/// PCA9641 register map.
pub mod grant {
    pub const ID_MAGIC: u8 = 0x38;

    pub const CONTROL: u8 = 0x01;
    pub const STATUS: u8 = 0x02;
    pub const TIME: u8 = 0x03;

    pub const CTL_LOCK_REQ: u8 = 1 << 0;
    pub const CTL_LOCK_GRANT: u8 = 1 << 1;
    pub const CTL_BUS_CONNECT: u8 = 1 << 2;
    pub const CTL_BUS_INIT: u8 = 1 << 3;
    pub const CTL_SMBUS_SWRST: u8 = 1 << 4;
    pub const CTL_IDLE_TIMER_DIS: u8 = 1 << 5;
    pub const CTL_SMBUS_DIS: u8 = 1 << 6;
    pub const CTL_PRIORITY: u8 = 1 << 7;

    pub const STS_OTHER_LOCK: u8 = 1 << 0;
    pub const STS_BUS_INIT_FAIL: u8 = 1 << 1;
    pub const STS_BUS_HUNG: u8 = 1 << 2;
    pub const STS_MBOX_EMPTY: u8 = 1 << 3;
    pub const STS_MBOX_FULL: u8 = 1 << 4;
    pub const STS_TEST_INT: u8 = 1 << 5;
    pub const STS_SCL_IO: u8 = 1 << 6;
    pub const STS_SDA_IO: u8 = 1 << 7;

    /// Release pattern written to hand the bus back.  Drops the lock request
    /// and bus connection, leaving only `PRIORITY` set.
    pub const RELEASE: u8 = CTL_PRIORITY;

    pub const fn lock_grant(ctl: u8) -> bool {
        ctl & CTL_LOCK_GRANT != 0
    }

    pub const fn other_lock(sts: u8) -> bool {
        sts & STS_OTHER_LOCK != 0
    }

    /// Neither master holds the lock.
    pub const fn bus_free(ctl: u8, sts: u8) -> bool {
        !lock_grant(ctl) && !other_lock(sts)
    }
}
