//! Release permission for the lock/grant variant.
//!
//! Where several local bindings share one physical lock/grant chip topology,
//! only one of them may physically hand the lock back.  That permission is
//! claimed exactly once from a [`ReleaseGate`], which hands out a single
//! [`ReleasePermit`].  The permit cannot be cloned, so at most one binding can
//! ever hold it.
//!
//! ```rust
//! use master_selector::permit::{BindingId, ReleaseGate};
//!
//! static RELEASE_GATE: ReleaseGate = ReleaseGate::new();
//!
//! let permit = RELEASE_GATE.claim(BindingId(3)).unwrap();
//! assert_eq!(permit.holder(), BindingId(3));
//! assert!(RELEASE_GATE.claim(BindingId(4)).is_err());
//! ```

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{Error, Result};

/// Opaque identifier of a local binding, typically the bus adapter number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(pub u32);

impl core::fmt::Display for BindingId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

const UNCLAIMED: u8 = 0;
const CLAIMING: u8 = 1;
const CLAIMED: u8 = 2;

/// Once-only holder of the release permission.
///
/// `const` constructible so it can live in a `static`.  Uses 32-bit and 8-bit
/// atomics only.
#[derive(Debug)]
pub struct ReleaseGate {
    state: AtomicU8,
    holder: AtomicU32,
}

impl ReleaseGate {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNCLAIMED),
            holder: AtomicU32::new(0),
        }
    }

    /// Claim the release permission for `id`.
    ///
    /// Fails with [`Error::PermitAlreadyClaimed`] if any binding, including
    /// `id` itself, has already claimed it.  Never blocks.
    pub fn claim(&self, id: BindingId) -> Result<ReleasePermit> {
        match self
            .state
            .compare_exchange(UNCLAIMED, CLAIMING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.holder.store(id.0, Ordering::Relaxed);
                self.state.store(CLAIMED, Ordering::Release);
                debug!("Release permission claimed by binding {id}");
                Ok(ReleasePermit { holder: id })
            }
            Err(_) => {
                // Winner may not have stored its id yet
                let holder = self.holder();
                warn!("Binding {id} tried to claim release permission held by {holder:?}");
                Err(Error::PermitAlreadyClaimed { holder })
            }
        }
    }

    /// Binding holding the permission, if claimed.
    pub fn holder(&self) -> Option<BindingId> {
        match self.state.load(Ordering::Acquire) {
            CLAIMED => Some(BindingId(self.holder.load(Ordering::Relaxed))),
            _ => None,
        }
    }
}

/// Proof that the holder may physically release a lock/grant chip.
///
/// Only [`ReleaseGate::claim`] creates these.
#[derive(Debug, PartialEq, Eq)]
pub struct ReleasePermit {
    holder: BindingId,
}

impl ReleasePermit {
    pub fn holder(&self) -> BindingId {
        self.holder
    }
}
