//! Scoped capability elevation.
//!
//! The conversion needs two privileged operations: creating a `0/0` character device (the
//! overlayfs whiteout) and writing a `trusted.*` extended attribute (the overlayfs opaque marker).
//! [`CapabilityManager::init`] reduces the calling thread to exactly those two capabilities in its
//! permitted set with nothing effective. [`CapabilityManager::with_capability`] then raises one of
//! them for the duration of a single action and lowers it again, including when the action fails
//! or unwinds.
//!
//! Linux capability sets are per-thread. The manager operates on the thread that created it and
//! is neither `Sync` nor reentrant.

use std::{cell::Cell, fmt};

use caps::{CapSet, CapsHashSet};

use crate::{OvlmarkError, OvlmarkResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A capability the conversion may raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// `CAP_MKNOD`, needed to create the overlayfs whiteout device.
    Mknod,

    /// `CAP_SYS_ADMIN`, needed to write `trusted.overlay.opaque`.
    SysAdmin,
}

/// Manipulates the capability sets of the calling thread.
///
/// [`ThreadCapabilities`] is the real implementation. The seam exists so that embedding tools can
/// plug in their own isolation strategy and so that the scoping rules can be tested without
/// privileges.
pub trait CapabilityBackend {
    /// Clears the effective and inheritable sets and reduces the permitted set to `permitted`.
    fn restrict(&self, permitted: &[Capability]) -> OvlmarkResult<()>;

    /// Adds `capability` to the effective set.
    fn raise(&self, capability: Capability) -> OvlmarkResult<()>;

    /// Removes `capability` from the effective set.
    fn lower(&self, capability: Capability) -> OvlmarkResult<()>;
}

/// [`CapabilityBackend`] backed by `capget(2)`/`capset(2)` on the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadCapabilities;

/// Holds the minimal permitted capability set and hands out scoped elevations.
#[derive(Debug)]
pub struct CapabilityManager<B = ThreadCapabilities> {
    backend: B,

    /// The capability currently in the effective set, if any.
    raised: Cell<Option<Capability>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Capability {
    /// Every capability the conversion uses.
    pub const ALL: [Capability; 2] = [Capability::Mknod, Capability::SysAdmin];

    fn as_caps(self) -> caps::Capability {
        match self {
            Capability::Mknod => caps::Capability::CAP_MKNOD,
            Capability::SysAdmin => caps::Capability::CAP_SYS_ADMIN,
        }
    }
}

impl ThreadCapabilities {
    /// Whether the calling thread has every capability in [`Capability::ALL`] in its permitted
    /// set, i.e. whether [`CapabilityManager::init`] can succeed.
    pub fn has_all_permitted() -> bool {
        match caps::read(None, CapSet::Permitted) {
            Ok(permitted) => Capability::ALL
                .iter()
                .all(|c| permitted.contains(&c.as_caps())),
            Err(_) => false,
        }
    }
}

impl CapabilityManager<ThreadCapabilities> {
    /// Restricts the current thread to `CAP_MKNOD` and `CAP_SYS_ADMIN` in its permitted set, with
    /// nothing effective.
    ///
    /// ## Errors
    ///
    /// Fails if either capability is not already permitted for the process, e.g. when running
    /// unprivileged.
    pub fn init() -> OvlmarkResult<Self> {
        Self::with_backend(ThreadCapabilities)
    }
}

impl<B: CapabilityBackend> CapabilityManager<B> {
    /// Creates a manager on top of `backend`, restricting it to [`Capability::ALL`].
    pub fn with_backend(backend: B) -> OvlmarkResult<Self> {
        backend.restrict(&Capability::ALL)?;
        tracing::debug!("restricted permitted capabilities to {:?}", Capability::ALL);

        Ok(Self {
            backend,
            raised: Cell::new(None),
        })
    }

    /// Runs `action` with `capability` raised into the effective set.
    ///
    /// The capability is lowered after `action` returns, whether it succeeded or not. If `action`
    /// panics, the capability is lowered while unwinding and the process aborts if that fails.
    ///
    /// ## Errors
    ///
    /// - [`OvlmarkError::NestedCapability`] if called from within another `with_capability`.
    /// - [`OvlmarkError::Privilege`] if raising or lowering fails. A lowering failure takes
    ///   precedence over the action's own error.
    /// - Whatever `action` returns.
    pub fn with_capability<T>(
        &self,
        capability: Capability,
        action: impl FnOnce() -> OvlmarkResult<T>,
    ) -> OvlmarkResult<T> {
        if let Some(held) = self.raised.get() {
            return Err(OvlmarkError::NestedCapability {
                held,
                requested: capability,
            });
        }

        self.backend.raise(capability)?;
        self.raised.set(Some(capability));

        let guard = scopeguard::guard_on_unwind((), |()| {
            if let Err(e) = self.backend.lower(capability) {
                tracing::error!("{} left raised while unwinding: {}", capability, e);
                std::process::abort();
            }
            self.raised.set(None);
        });

        let result = action();

        scopeguard::ScopeGuard::into_inner(guard);
        self.backend.lower(capability)?;
        self.raised.set(None);

        result
    }

    /// Returns the capability currently raised, if any.
    pub fn raised(&self) -> Option<Capability> {
        self.raised.get()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_caps())
    }
}

impl CapabilityBackend for ThreadCapabilities {
    fn restrict(&self, permitted: &[Capability]) -> OvlmarkResult<()> {
        let permitted: CapsHashSet = permitted.iter().map(|c| c.as_caps()).collect();

        // The effective set must stay a subset of the permitted set, so it goes first.
        caps::clear(None, CapSet::Effective).map_err(OvlmarkError::CapabilityInit)?;
        caps::clear(None, CapSet::Inheritable).map_err(OvlmarkError::CapabilityInit)?;
        caps::set(None, CapSet::Permitted, &permitted).map_err(OvlmarkError::CapabilityInit)?;

        Ok(())
    }

    fn raise(&self, capability: Capability) -> OvlmarkResult<()> {
        caps::raise(None, CapSet::Effective, capability.as_caps()).map_err(|source| {
            OvlmarkError::Privilege {
                operation: "raise",
                capability,
                source,
            }
        })
    }

    fn lower(&self, capability: Capability) -> OvlmarkResult<()> {
        caps::drop(None, CapSet::Effective, capability.as_caps()).map_err(|source| {
            OvlmarkError::Privilege {
                operation: "lower",
                capability,
                source,
            }
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
