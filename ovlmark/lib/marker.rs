//! aufs marker classification and translation into overlayfs markers.
//!
//! aufs records a deletion as an empty file named `.wh.<name>` next to the deleted entry, and an
//! opaque directory as a file named `.wh..wh..opq` inside it. overlayfs records a deletion as a
//! character device `<name>` with device number `0/0`, and an opaque directory as the
//! `trusted.overlay.opaque=y` extended attribute on the directory itself.

use std::{
    ffi::{CStr, OsStr},
    os::unix::ffi::OsStrExt,
    path::Path,
};

use crate::{
    privilege::{Capability, CapabilityBackend, CapabilityManager, ThreadCapabilities},
    sys::{DirHandle, Removal},
    OvlmarkError, OvlmarkResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The prefix of an aufs whiteout.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// The name of the aufs opaque directory marker.
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

/// The extended attribute overlayfs reads to decide whether a directory is opaque.
pub const OPAQUE_XATTR: &CStr = c"trusted.overlay.opaque";

/// The value of [`OPAQUE_XATTR`] on an opaque directory.
pub const OPAQUE_XATTR_VALUE: &[u8] = b"y";

/// Mode of an overlayfs whiteout.
pub const WHITEOUT_MODE: libc::mode_t = libc::S_IFCHR | 0o600;

/// The double prefix that starts every aufs metadata entry.
const RESERVED_PREFIX: &str = ".wh..wh.";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What an entry name means under the aufs convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker<'a> {
    /// Not a marker.
    Plain,

    /// `.wh..wh..opq`: the containing directory is opaque.
    Opaque,

    /// `.wh.<target>`: `target` is deleted in this layer.
    Whiteout(&'a OsStr),

    /// Any other `.wh..wh.` name (aufs metadata such as `.wh..wh.aufs` or `.wh..wh.plnk`), or a
    /// bare `.wh.`. overlayfs has no equivalent.
    Unsupported,
}

/// The actions the walk performs on markers.
///
/// `dir` is the working location: the open directory containing the entry. `path` is the full
/// path of the entry, for error messages and logs only.
pub trait TranslateMarker {
    /// Removes an aufs opaque marker.
    fn remove_opaque_marker(
        &mut self,
        dir: &DirHandle,
        name: &OsStr,
        removal: Removal,
        path: &Path,
    ) -> OvlmarkResult<()>;

    /// Replaces the aufs whiteout `marker` with an overlayfs whiteout for `target`.
    fn translate_whiteout(
        &mut self,
        dir: &DirHandle,
        marker: &OsStr,
        target: &OsStr,
        removal: Removal,
        path: &Path,
    ) -> OvlmarkResult<()>;

    /// Marks the directory `name` inside `dir` as an overlayfs opaque directory.
    fn mark_directory_opaque(
        &mut self,
        dir: &DirHandle,
        name: &OsStr,
        path: &Path,
    ) -> OvlmarkResult<()>;
}

/// Performs the translation on disk, raising a capability for each privileged step.
#[derive(Debug)]
pub struct Translator<B = ThreadCapabilities> {
    capabilities: CapabilityManager<B>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<B: CapabilityBackend> Translator<B> {
    /// Creates a translator that raises capabilities through `capabilities`.
    pub fn new(capabilities: CapabilityManager<B>) -> Self {
        Self { capabilities }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Classifies an entry name.
///
/// ## Examples
///
/// ```
/// use std::ffi::OsStr;
/// use ovlmark::marker::{classify, Marker};
///
/// assert_eq!(classify(OsStr::new(".wh..wh..opq")), Marker::Opaque);
/// assert_eq!(classify(OsStr::new(".wh..wh.aufs")), Marker::Unsupported);
/// assert_eq!(classify(OsStr::new(".wh.passwd")), Marker::Whiteout(OsStr::new("passwd")));
/// assert_eq!(classify(OsStr::new("passwd")), Marker::Plain);
/// ```
pub fn classify(name: &OsStr) -> Marker<'_> {
    let bytes = name.as_bytes();

    if bytes == WHITEOUT_OPAQUE.as_bytes() {
        return Marker::Opaque;
    }

    if bytes.starts_with(RESERVED_PREFIX.as_bytes()) {
        return Marker::Unsupported;
    }

    match bytes.strip_prefix(WHITEOUT_PREFIX.as_bytes()) {
        Some([]) => Marker::Unsupported,
        Some(target) => Marker::Whiteout(OsStr::from_bytes(target)),
        None => Marker::Plain,
    }
}

/// Fails the conversion on a marker overlayfs cannot represent.
pub fn reject_unsupported(path: &Path) -> OvlmarkResult<()> {
    Err(OvlmarkError::UnsupportedWhiteout {
        path: path.to_path_buf(),
    })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<B: CapabilityBackend> TranslateMarker for Translator<B> {
    fn remove_opaque_marker(
        &mut self,
        dir: &DirHandle,
        name: &OsStr,
        removal: Removal,
        path: &Path,
    ) -> OvlmarkResult<()> {
        dir.unlink_at(name, removal)
            .map_err(|e| OvlmarkError::io("remove opaque aufs whiteout", path, e))?;

        tracing::debug!("removed opaque aufs whiteout: {}", path.display());
        Ok(())
    }

    fn translate_whiteout(
        &mut self,
        dir: &DirHandle,
        marker: &OsStr,
        target: &OsStr,
        removal: Removal,
        path: &Path,
    ) -> OvlmarkResult<()> {
        dir.unlink_at(marker, removal)
            .map_err(|e| OvlmarkError::io("remove aufs whiteout", path, e))?;

        let target_path = path.with_file_name(target);
        self.capabilities.with_capability(Capability::Mknod, || {
            dir.mknod_at(target, WHITEOUT_MODE, nix::sys::stat::makedev(0, 0))
                .map_err(|e| OvlmarkError::io("create overlayfs whiteout", &target_path, e))
        })?;

        tracing::debug!(
            "converted aufs whiteout: {} -> {}",
            path.display(),
            target_path.display()
        );
        Ok(())
    }

    fn mark_directory_opaque(
        &mut self,
        dir: &DirHandle,
        name: &OsStr,
        path: &Path,
    ) -> OvlmarkResult<()> {
        let target = dir
            .open_at(name)
            .map_err(|e| OvlmarkError::io("open opaque directory", path, e))?;

        self.capabilities.with_capability(Capability::SysAdmin, || {
            target
                .set_xattr_create(OPAQUE_XATTR, OPAQUE_XATTR_VALUE)
                .map_err(|e| OvlmarkError::io("create opaque overlayfs whiteout", path, e))
        })?;

        tracing::debug!("marked directory opaque: {}", path.display());
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{
        fs,
        os::unix::fs::{FileTypeExt, MetadataExt},
    };

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_classify_opaque() {
        assert_eq!(classify(OsStr::new(".wh..wh..opq")), Marker::Opaque);
        assert_eq!(classify(OsStr::new(".wh..wh..opqx")), Marker::Unsupported);
        assert_eq!(classify(OsStr::new("x.wh..wh..opq")), Marker::Plain);
    }

    #[test]
    fn test_classify_reserved() {
        assert_eq!(classify(OsStr::new(".wh..wh.aufs")), Marker::Unsupported);
        assert_eq!(classify(OsStr::new(".wh..wh.plnk")), Marker::Unsupported);
        assert_eq!(classify(OsStr::new(".wh..wh.")), Marker::Unsupported);
        assert_eq!(classify(OsStr::new(".wh.")), Marker::Unsupported);
    }

    #[test]
    fn test_classify_whiteout() {
        assert_eq!(
            classify(OsStr::new(".wh.b")),
            Marker::Whiteout(OsStr::new("b"))
        );
        assert_eq!(
            classify(OsStr::new(".wh..bashrc")),
            Marker::Whiteout(OsStr::new(".bashrc"))
        );
        assert_eq!(
            classify(OsStr::new(".wh..wh")),
            Marker::Whiteout(OsStr::new(".wh"))
        );
    }

    #[test]
    fn test_classify_plain() {
        assert_eq!(classify(OsStr::new("b")), Marker::Plain);
        assert_eq!(classify(OsStr::new(".wh")), Marker::Plain);
        assert_eq!(classify(OsStr::new(".WH.b")), Marker::Plain);
        assert_eq!(classify(OsStr::new("")), Marker::Plain);
    }

    #[test]
    fn test_classify_non_utf8() {
        let name = OsStr::from_bytes(b".wh.\xff\xfe");
        assert_eq!(
            classify(name),
            Marker::Whiteout(OsStr::from_bytes(b"\xff\xfe"))
        );
        assert_eq!(classify(OsStr::from_bytes(b"\xff.wh.")), Marker::Plain);
    }

    #[test]
    fn test_reject_unsupported_names_path() {
        let err = reject_unsupported(Path::new("/layer/.wh..wh.aufs")).unwrap_err();
        assert_eq!(err.to_string(), "unsupported aufs whiteout: /layer/.wh..wh.aufs");
    }

    #[test_log::test]
    fn test_translator_translates_whiteout() -> anyhow::Result<()> {
        if !ThreadCapabilities::has_all_permitted() {
            tracing::warn!("skipping: CAP_MKNOD and CAP_SYS_ADMIN are not permitted");
            return Ok(());
        }

        let temp_dir = tempdir()?;
        fs::write(temp_dir.path().join(".wh.b"), b"")?;

        let mut translator = Translator::new(CapabilityManager::init()?);
        let dir = DirHandle::open(temp_dir.path())?;
        translator.translate_whiteout(
            &dir,
            OsStr::new(".wh.b"),
            OsStr::new("b"),
            Removal::File,
            &temp_dir.path().join(".wh.b"),
        )?;

        assert!(!temp_dir.path().join(".wh.b").exists());
        let metadata = fs::symlink_metadata(temp_dir.path().join("b"))?;
        assert!(metadata.file_type().is_char_device());
        assert_eq!(metadata.rdev(), 0);
        assert_eq!(metadata.mode() & 0o777, 0o600);

        Ok(())
    }

    #[test_log::test]
    fn test_translator_marks_directory_opaque_once() -> anyhow::Result<()> {
        if !ThreadCapabilities::has_all_permitted() {
            tracing::warn!("skipping: CAP_MKNOD and CAP_SYS_ADMIN are not permitted");
            return Ok(());
        }

        let temp_dir = tempdir()?;
        fs::create_dir(temp_dir.path().join("a"))?;

        let mut translator = Translator::new(CapabilityManager::init()?);
        let dir = DirHandle::open(temp_dir.path())?;
        let path = temp_dir.path().join("a");
        translator.mark_directory_opaque(&dir, OsStr::new("a"), &path)?;

        // Reading a trusted attribute needs CAP_SYS_ADMIN as well.
        let value = translator
            .capabilities
            .with_capability(Capability::SysAdmin, || {
                xattr::get(&path, "trusted.overlay.opaque")
                    .map_err(|e| OvlmarkError::io("read opaque xattr", &path, e))
            })?;
        assert_eq!(value, Some(b"y".to_vec()));
        assert_eq!(translator.capabilities.raised(), None);

        // Create-only: a second marking fails.
        let err = translator
            .mark_directory_opaque(&dir, OsStr::new("a"), &path)
            .unwrap_err();
        match err {
            OvlmarkError::Io {
                path: err_path,
                source,
                ..
            } => {
                assert_eq!(err_path, path);
                assert_eq!(source.raw_os_error(), Some(libc::EEXIST));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        Ok(())
    }

    #[test]
    fn test_translator_reports_missing_whiteout() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let manager = CapabilityManager::with_backend(helper::Unprivileged)?;
        let mut translator = Translator::new(manager);
        let dir = DirHandle::open(temp_dir.path())?;

        let path = temp_dir.path().join(".wh.b");
        let err = translator
            .translate_whiteout(
                &dir,
                OsStr::new(".wh.b"),
                OsStr::new("b"),
                Removal::File,
                &path,
            )
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            format!("failed to remove aufs whiteout: {}", path.display())
        );
        assert!(!temp_dir.path().join("b").exists());

        Ok(())
    }

    #[test]
    fn test_translator_removes_opaque_marker() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        fs::write(temp_dir.path().join(WHITEOUT_OPAQUE), b"")?;
        fs::write(temp_dir.path().join("keep"), b"")?;

        let manager = CapabilityManager::with_backend(helper::Unprivileged)?;
        let mut translator = Translator::new(manager);
        let dir = DirHandle::open(temp_dir.path())?;
        translator.remove_opaque_marker(
            &dir,
            OsStr::new(WHITEOUT_OPAQUE),
            Removal::File,
            &temp_dir.path().join(WHITEOUT_OPAQUE),
        )?;

        assert!(!temp_dir.path().join(WHITEOUT_OPAQUE).exists());
        assert!(temp_dir.path().join("keep").exists());

        Ok(())
    }

    mod helper {
        use super::*;

        /// Leaves the thread's capabilities alone.
        pub(super) struct Unprivileged;

        impl CapabilityBackend for Unprivileged {
            fn restrict(&self, _permitted: &[Capability]) -> OvlmarkResult<()> {
                Ok(())
            }

            fn raise(&self, _capability: Capability) -> OvlmarkResult<()> {
                Ok(())
            }

            fn lower(&self, _capability: Capability) -> OvlmarkResult<()> {
                Ok(())
            }
        }
    }
}
