//! Directory handles for the walk.
//!
//! A [`DirHandle`] is the walk's working location: every operation takes a name relative to an
//! open directory instead of a full path, so nothing is resolved through a symlink and nothing
//! depends on the process working directory.

use std::{
    ffi::{CStr, CString, OsStr, OsString},
    fs::File,
    io,
    mem::MaybeUninit,
    os::{
        fd::{AsRawFd, FromRawFd},
        unix::ffi::OsStrExt,
    },
    path::Path,
};

use nix::dir::Dir;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const DIR_FLAGS: libc::c_int = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_NOFOLLOW | libc::O_CLOEXEC;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An open directory.
#[derive(Debug)]
pub struct DirHandle {
    file: File,
}

/// The parts of `stat(2)` the walk looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStat {
    /// File type and permission bits.
    pub mode: libc::mode_t,

    /// Device of the filesystem containing the entry.
    pub dev: libc::dev_t,

    /// Device id, for character and block devices.
    pub rdev: libc::dev_t,

    /// Inode number.
    pub ino: libc::ino_t,
}

/// How an entry is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// `unlink(2)` semantics.
    File,

    /// `rmdir(2)` semantics.
    Directory,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DirHandle {
    /// Opens `path` as a directory without following a trailing symlink.
    pub fn open(path: &Path) -> io::Result<Self> {
        let path = to_cstring(path.as_os_str())?;
        let fd = unsafe { libc::open(path.as_ptr(), DIR_FLAGS) };
        Self::from_fd(fd)
    }

    /// Opens the subdirectory `name` without following symlinks.
    pub fn open_at(&self, name: &OsStr) -> io::Result<Self> {
        let name = to_cstring(name)?;
        let fd = unsafe { libc::openat(self.file.as_raw_fd(), name.as_ptr(), DIR_FLAGS) };
        Self::from_fd(fd)
    }

    fn from_fd(fd: libc::c_int) -> io::Result<Self> {
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // Safe because we just opened this fd.
        Ok(Self {
            file: unsafe { File::from_raw_fd(fd) },
        })
    }

    /// Returns the names in this directory, without `.` and `..`.
    pub fn entries(&self) -> io::Result<Vec<OsString>> {
        // A duplicate keeps `self` usable after `Dir` closes its descriptor.
        let mut dir = Dir::from(self.file.try_clone()?)?;

        let mut names = Vec::new();
        for entry in dir.iter() {
            let entry = entry?;
            let name = entry.file_name().to_bytes();
            if name == b"." || name == b".." {
                continue;
            }
            names.push(OsStr::from_bytes(name).to_os_string());
        }

        Ok(names)
    }

    /// Returns the status of this directory.
    pub fn stat(&self) -> io::Result<EntryStat> {
        self.fstatat(c"", libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW)
    }

    /// Returns the status of `name` without following symlinks.
    pub fn stat_at(&self, name: &OsStr) -> io::Result<EntryStat> {
        let name = to_cstring(name)?;
        self.fstatat(&name, libc::AT_SYMLINK_NOFOLLOW)
    }

    fn fstatat(&self, name: &CStr, flags: libc::c_int) -> io::Result<EntryStat> {
        let mut st = MaybeUninit::<libc::stat>::zeroed();

        // Safe because the kernel only writes into `st` and we check the return value.
        let res =
            unsafe { libc::fstatat(self.file.as_raw_fd(), name.as_ptr(), st.as_mut_ptr(), flags) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }

        // Safe because fstatat succeeded.
        let st = unsafe { st.assume_init() };
        Ok(EntryStat {
            mode: st.st_mode,
            dev: st.st_dev,
            rdev: st.st_rdev,
            ino: st.st_ino,
        })
    }

    /// Removes `name` from this directory.
    pub fn unlink_at(&self, name: &OsStr, removal: Removal) -> io::Result<()> {
        let name = to_cstring(name)?;
        let flags = match removal {
            Removal::File => 0,
            Removal::Directory => libc::AT_REMOVEDIR,
        };

        let res = unsafe { libc::unlinkat(self.file.as_raw_fd(), name.as_ptr(), flags) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Creates the special file `name` in this directory.
    pub fn mknod_at(&self, name: &OsStr, mode: libc::mode_t, dev: libc::dev_t) -> io::Result<()> {
        let name = to_cstring(name)?;

        let res = unsafe { libc::mknodat(self.file.as_raw_fd(), name.as_ptr(), mode, dev) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Sets the extended attribute `key` on this directory, failing with `EEXIST` if it is
    /// already present.
    pub fn set_xattr_create(&self, key: &CStr, value: &[u8]) -> io::Result<()> {
        // Safe because this doesn't modify any memory and we check the return value.
        let res = unsafe {
            libc::fsetxattr(
                self.file.as_raw_fd(),
                key.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                libc::XATTR_CREATE,
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

impl EntryStat {
    /// Whether the entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    /// Whether the entry is a character device.
    pub fn is_char_device(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFCHR
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn to_cstring(name: &OsStr) -> io::Result<CString> {
    CString::new(name.as_bytes()).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::symlink};

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_dir_handle_lists_entries() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        fs::write(temp_dir.path().join("file"), b"")?;
        fs::create_dir(temp_dir.path().join("dir"))?;
        fs::write(temp_dir.path().join(".wh.gone"), b"")?;

        let handle = DirHandle::open(temp_dir.path())?;
        let mut names = handle.entries()?;
        names.sort();
        assert_eq!(names, [".wh.gone", "dir", "file"]);

        // Listing twice still works because the handle keeps its own descriptor.
        assert_eq!(handle.entries()?.len(), 3);

        Ok(())
    }

    #[test]
    fn test_dir_handle_does_not_follow_symlinks() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        fs::create_dir(temp_dir.path().join("real"))?;
        symlink("real", temp_dir.path().join("link"))?;

        let handle = DirHandle::open(temp_dir.path())?;
        let err = handle.open_at(OsStr::new("link")).unwrap_err();
        assert!(matches!(err.raw_os_error(), Some(libc::ELOOP) | Some(libc::ENOTDIR)));

        let stat = handle.stat_at(OsStr::new("link"))?;
        assert!(!stat.is_dir());
        assert_eq!(stat.mode & libc::S_IFMT, libc::S_IFLNK);

        assert!(DirHandle::open(&temp_dir.path().join("link")).is_err());

        Ok(())
    }

    #[test]
    fn test_dir_handle_stat_reports_device() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        fs::create_dir(temp_dir.path().join("sub"))?;

        let handle = DirHandle::open(temp_dir.path())?;
        let root = handle.stat()?;
        let sub = handle.stat_at(OsStr::new("sub"))?;

        assert!(root.is_dir());
        assert!(sub.is_dir());
        assert_eq!(root.dev, sub.dev);
        assert_ne!(root.ino, sub.ino);

        // `..` of the subdirectory is the directory itself.
        let parent = handle.open_at(OsStr::new("sub"))?.open_at(OsStr::new(".."))?;
        assert_eq!(parent.stat()?, root);

        Ok(())
    }

    #[test]
    fn test_dir_handle_unlink_at() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        fs::write(temp_dir.path().join("file"), b"")?;
        fs::create_dir(temp_dir.path().join("dir"))?;

        let handle = DirHandle::open(temp_dir.path())?;
        assert!(handle
            .unlink_at(OsStr::new("dir"), Removal::File)
            .is_err());

        handle.unlink_at(OsStr::new("file"), Removal::File)?;
        handle.unlink_at(OsStr::new("dir"), Removal::Directory)?;
        assert!(handle.entries()?.is_empty());

        Ok(())
    }

    #[test]
    fn test_dir_handle_mknod_at_fifo() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;

        let handle = DirHandle::open(temp_dir.path())?;
        handle.mknod_at(OsStr::new("pipe"), libc::S_IFIFO | 0o600, 0)?;

        let stat = handle.stat_at(OsStr::new("pipe"))?;
        assert_eq!(stat.mode & libc::S_IFMT, libc::S_IFIFO);
        assert!(!stat.is_char_device());

        let err = handle
            .mknod_at(OsStr::new("pipe"), libc::S_IFIFO | 0o600, 0)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));

        Ok(())
    }

    #[test]
    fn test_dir_handle_set_xattr_create_only() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let handle = DirHandle::open(temp_dir.path())?;

        match handle.set_xattr_create(c"user.ovlmark.test", b"y") {
            Ok(()) => {}
            // Some test filesystems do not support user xattrs.
            Err(e) if e.raw_os_error() == Some(libc::EOPNOTSUPP) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        assert_eq!(
            xattr::get(temp_dir.path(), "user.ovlmark.test")?,
            Some(b"y".to_vec())
        );

        let err = handle
            .set_xattr_create(c"user.ovlmark.test", b"y")
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));

        Ok(())
    }

    #[test]
    fn test_entry_names_may_not_contain_nul() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let handle = DirHandle::open(temp_dir.path())?;

        let err = handle.stat_at(OsStr::from_bytes(b"a\0b")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));

        Ok(())
    }
}
