use std::{io, path::PathBuf};

use thiserror::Error;

use crate::privilege::Capability;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an ovlmark-related operation.
pub type OvlmarkResult<T> = Result<T, OvlmarkError>;

/// An error that stops a conversion.
///
/// Every variant is fatal: the walk stops at the first error and leaves the entries converted so
/// far in place.
#[derive(pretty_error_debug::Debug, Error)]
pub enum OvlmarkError {
    /// Restricting the capability sets of the current thread failed.
    #[error("failed to set capabilities")]
    CapabilityInit(#[source] caps::errors::CapsError),

    /// Raising or lowering a single capability failed.
    #[error("failed to {operation} {capability}")]
    Privilege {
        /// What was being done to the capability set.
        operation: &'static str,

        /// The capability involved.
        capability: Capability,

        /// The underlying error.
        #[source]
        source: caps::errors::CapsError,
    },

    /// A capability was requested while another one was still raised.
    #[error("cannot raise {requested} while {held} is still raised")]
    NestedCapability {
        /// The capability currently in the effective set.
        held: Capability,

        /// The capability that was requested.
        requested: Capability,
    },

    /// The tree contains an aufs marker with no overlayfs equivalent.
    #[error("unsupported aufs whiteout: {}", path.display())]
    UnsupportedWhiteout {
        /// Path of the offending entry.
        path: PathBuf,
    },

    /// A filesystem operation failed.
    #[error("failed to {operation}: {}", path.display())]
    Io {
        /// The operation that failed.
        operation: &'static str,

        /// Path the operation was applied to.
        path: PathBuf,

        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// An opaque marker was still pending when another directory was entered or another marker
    /// was found.
    #[error("opaque marker still pending at: {}", path.display())]
    PendingOpaque {
        /// Path where the stale flag was detected.
        path: PathBuf,
    },

    /// The root of the conversion is not a directory.
    #[error("not a directory: {}", path.display())]
    NotADirectory {
        /// The root path.
        path: PathBuf,
    },

    /// A directory closed to save descriptors was replaced before the walk returned to it.
    #[error("directory moved during the walk: {}", path.display())]
    DirectoryMoved {
        /// Path the directory had when it was first entered.
        path: PathBuf,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OvlmarkError {
    /// Creates an [`OvlmarkError::Io`] for `operation` applied to `path`.
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        OvlmarkError::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Returns the path the error refers to, if there is one.
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            OvlmarkError::UnsupportedWhiteout { path }
            | OvlmarkError::Io { path, .. }
            | OvlmarkError::PendingOpaque { path }
            | OvlmarkError::NotADirectory { path }
            | OvlmarkError::DirectoryMoved { path } => Some(path),
            OvlmarkError::CapabilityInit(_)
            | OvlmarkError::Privilege { .. }
            | OvlmarkError::NestedCapability { .. } => None,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
