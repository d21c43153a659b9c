//! `ovlmark` converts a layer directory that uses aufs whiteout conventions into one that uses
//! overlayfs conventions, in place.
//!
//! # Overview
//!
//! Layers exported from aufs-based container storage record deletions as marker files:
//!
//! - `.wh.NAME` hides `NAME` in the lower layers.
//! - `.wh..wh..opq` hides every lower-layer entry of the directory it sits in.
//!
//! overlayfs expects a `0:0` character device named `NAME` for the first and the
//! `trusted.overlay.opaque=y` extended attribute on the directory for the second. `ovlmark` walks
//! the layer once, replacing each aufs marker with its overlayfs counterpart.
//!
//! # Privileges
//!
//! Creating device nodes needs `CAP_MKNOD` and writing `trusted.*` attributes needs
//! `CAP_SYS_ADMIN`. Before walking, the calling thread's permitted set is reduced to exactly
//! those two, and each is raised only for the single system call that needs it.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! fn main() -> ovlmark::OvlmarkResult<()> {
//!     let stats = ovlmark::convert("/var/lib/layers/3f2a")?;
//!     println!("{} opaque directories", stats.get_opaque_dirs());
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`cli`] - Command-line arguments
//! - [`marker`] - Marker classification and translation
//! - [`privilege`] - Capability restriction and scoped elevation
//! - [`sys`] - Directory handles for name-relative system calls
//! - [`walk`] - The post-order walk

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cli;
pub mod marker;
pub mod privilege;
pub mod sys;
pub mod walk;

pub use error::*;
pub use walk::{convert, ConversionStats};
