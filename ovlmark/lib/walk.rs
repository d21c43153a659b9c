//! The post-order directory walk that drives the conversion.
//!
//! The walk is depth-first and post-order: a directory is closed only after everything below it
//! has been processed. It is physical (symlinks are never followed) and stays on the filesystem of
//! the root. Every marker is addressed by name relative to an open handle on its parent.
//!
//! The walk is iterative and keeps at most [`MAX_OPEN_DIRS`] directory handles open, so neither
//! the stack nor the descriptor table grows with the depth of the tree. When the limit is reached
//! the handle of the outermost open ancestor is closed. Returning to such a directory reopens it
//! through `..` of its child, and its device and inode must match what was recorded on entry.
//!
//! The walker carries a single pending-opaque flag. An opaque marker sets it and the next
//! directory close event consumes it. This is only correct if no other directory can close in
//! between, so within each directory the walker processes every subdirectory before any other
//! entry. The flag is checked on every directory entry and every opaque marker, and a stale flag
//! fails the walk with [`OvlmarkError::PendingOpaque`].

use std::{
    ffi::{OsStr, OsString},
    io, mem,
    path::{Path, PathBuf},
    vec,
};

use getset::CopyGetters;

use crate::{
    marker::{self, Marker, TranslateMarker, Translator, WHITEOUT_OPAQUE},
    privilege::CapabilityManager,
    sys::{DirHandle, EntryStat, Removal},
    OvlmarkError, OvlmarkResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The most directory handles a walk keeps open at once.
pub const MAX_OPEN_DIRS: usize = 64;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Counters reported at the end of a conversion.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub with_prefix")]
pub struct ConversionStats {
    /// aufs whiteouts replaced by overlayfs whiteouts.
    whiteouts: u64,

    /// Directories marked opaque.
    opaque_dirs: u64,

    /// Directories walked, including the root.
    directories: u64,

    /// Entries visited below the root.
    entries: u64,

    /// Subdirectories skipped because they live on another filesystem.
    skipped_mounts: u64,

    /// Subdirectories that could not be opened for reading.
    unreadable_dirs: u64,
}

/// Walks a layer directory and hands every marker to a [`TranslateMarker`].
///
/// A walker is consumed by [`Walker::walk`] and cannot be restarted.
#[derive(Debug)]
pub struct Walker<T> {
    translator: T,

    /// Whether the directory about to be closed contained an opaque marker.
    pending_opaque: bool,

    /// Device of the root directory.
    root_dev: libc::dev_t,

    max_open_dirs: usize,

    stats: ConversionStats,
}

/// A directory on the walk stack.
#[derive(Debug)]
struct Frame {
    /// Name in the parent directory. Empty for the root.
    name: OsString,

    path: PathBuf,

    /// `None` while closed to stay under the open handle limit.
    handle: Option<DirHandle>,

    dev: libc::dev_t,
    ino: libc::ino_t,

    /// Subdirectories still to visit, in order.
    subdirs: vec::IntoIter<(OsString, EntryStat)>,

    /// Everything else still to visit, in order.
    rest: vec::IntoIter<(OsString, EntryStat)>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<T: TranslateMarker> Walker<T> {
    /// Creates a walker that performs its actions through `translator`.
    pub fn new(translator: T) -> Self {
        Self {
            translator,
            pending_opaque: false,
            root_dev: 0,
            max_open_dirs: MAX_OPEN_DIRS,
            stats: ConversionStats::default(),
        }
    }

    /// Converts every marker under `root`.
    ///
    /// The root's own name is never treated as a marker. If the root contains an opaque marker,
    /// the root itself is marked opaque.
    ///
    /// ## Errors
    ///
    /// Stops at the first failure. Markers converted before the failure stay converted.
    pub fn walk(mut self, root: impl AsRef<Path>) -> OvlmarkResult<ConversionStats> {
        let root = root.as_ref();

        let handle = DirHandle::open(root).map_err(|e| match e.raw_os_error() {
            Some(libc::ENOTDIR) | Some(libc::ELOOP) => OvlmarkError::NotADirectory {
                path: root.to_path_buf(),
            },
            _ => OvlmarkError::io("open directory", root, e),
        })?;
        self.root_dev = handle
            .stat()
            .map_err(|e| OvlmarkError::io("stat directory", root, e))?
            .dev;

        self.run(handle, root)?;

        tracing::debug!("finished walking {}", root.display());
        Ok(self.stats)
    }

    /// Walks the tree below the already opened `root`.
    fn run(&mut self, root: DirHandle, path: &Path) -> OvlmarkResult<()> {
        let frame = self.enter(root, OsString::new(), path.to_path_buf())?;
        let mut stack = vec![frame];

        while let Some(top) = stack.last_mut() {
            let next = match top.subdirs.next() {
                Some(entry) => Some(entry),
                None => top.rest.next(),
            };
            let Some((name, stat)) = next else {
                self.close(&mut stack)?;
                continue;
            };

            let path = top.path.join(&name);
            self.stats.entries += 1;

            if !stat.is_dir() {
                self.visit_name(top.handle()?, &name, Removal::File, &path)?;
                continue;
            }

            if stat.dev != self.root_dev {
                tracing::warn!("not crossing into another filesystem: {}", path.display());
                self.stats.skipped_mounts += 1;
                continue;
            }

            let opened = top.handle()?.open_at(&name);
            match opened {
                Ok(child) => {
                    let frame = self.enter(child, name, path)?;
                    stack.push(frame);
                    release_handles(&mut stack, self.max_open_dirs);
                }
                Err(e) if e.raw_os_error() == Some(libc::EACCES) => {
                    tracing::warn!("cannot read directory: {}", path.display());
                    self.stats.unreadable_dirs += 1;
                    self.visit_name(top.handle()?, &name, Removal::Directory, &path)?;
                }
                Err(e) => return Err(OvlmarkError::io("open directory", &path, e)),
            }
        }

        Ok(())
    }

    /// Snapshots the entries of a directory: subdirectories first, then everything else, each in
    /// byte order.
    fn enter(&mut self, handle: DirHandle, name: OsString, path: PathBuf) -> OvlmarkResult<Frame> {
        if self.pending_opaque {
            return Err(OvlmarkError::PendingOpaque { path });
        }
        self.stats.directories += 1;

        let own = handle
            .stat()
            .map_err(|e| OvlmarkError::io("stat directory", &path, e))?;
        let mut names = handle
            .entries()
            .map_err(|e| OvlmarkError::io("read directory", &path, e))?;
        names.sort();

        let mut subdirs = Vec::new();
        let mut rest = Vec::new();
        for name in names {
            let stat = handle
                .stat_at(&name)
                .map_err(|e| OvlmarkError::io("stat", path.join(&name), e))?;

            if stat.is_dir() && name != WHITEOUT_OPAQUE {
                subdirs.push((name, stat));
            } else {
                rest.push((name, stat));
            }
        }

        Ok(Frame {
            name,
            path,
            handle: Some(handle),
            dev: own.dev,
            ino: own.ino,
            subdirs: subdirs.into_iter(),
            rest: rest.into_iter(),
        })
    }

    /// Pops the finished directory and handles its close event in the parent.
    fn close(&mut self, stack: &mut Vec<Frame>) -> OvlmarkResult<()> {
        let Some(mut frame) = stack.pop() else {
            return Ok(());
        };

        let Some(parent) = stack.last_mut() else {
            // The root: marked through its own handle, never classified.
            if mem::take(&mut self.pending_opaque) {
                self.translator
                    .mark_directory_opaque(frame.handle()?, OsStr::new("."), &frame.path)?;
                self.stats.opaque_dirs += 1;
            }
            return Ok(());
        };

        if parent.handle.is_none() {
            parent.reopen_from(&frame)?;
        }
        drop(frame.handle.take());

        let dir = parent.handle()?;
        if mem::take(&mut self.pending_opaque) {
            self.translator
                .mark_directory_opaque(dir, &frame.name, &frame.path)?;
            self.stats.opaque_dirs += 1;
        }

        self.visit_name(dir, &frame.name, Removal::Directory, &frame.path)
    }

    /// Classifies `name` and acts on it.
    fn visit_name(
        &mut self,
        dir: &DirHandle,
        name: &OsStr,
        removal: Removal,
        path: &Path,
    ) -> OvlmarkResult<()> {
        match marker::classify(name) {
            Marker::Plain => Ok(()),
            Marker::Opaque => {
                if self.pending_opaque {
                    return Err(OvlmarkError::PendingOpaque {
                        path: path.to_path_buf(),
                    });
                }
                self.pending_opaque = true;
                self.translator
                    .remove_opaque_marker(dir, name, removal, path)
            }
            Marker::Whiteout(target) => {
                self.translator
                    .translate_whiteout(dir, name, target, removal, path)?;
                self.stats.whiteouts += 1;
                Ok(())
            }
            Marker::Unsupported => marker::reject_unsupported(path),
        }
    }
}

impl Frame {
    fn handle(&self) -> OvlmarkResult<&DirHandle> {
        self.handle.as_ref().ok_or_else(|| {
            OvlmarkError::io(
                "use directory",
                &self.path,
                io::Error::from_raw_os_error(libc::EBADF),
            )
        })
    }

    /// Reopens this directory as `..` of `child`.
    fn reopen_from(&mut self, child: &Frame) -> OvlmarkResult<()> {
        let handle = child
            .handle()?
            .open_at(OsStr::new(".."))
            .map_err(|e| OvlmarkError::io("reopen directory", &self.path, e))?;
        let stat = handle
            .stat()
            .map_err(|e| OvlmarkError::io("stat directory", &self.path, e))?;

        if (stat.dev, stat.ino) != (self.dev, self.ino) {
            return Err(OvlmarkError::DirectoryMoved {
                path: self.path.clone(),
            });
        }

        tracing::trace!("reopened {}", self.path.display());
        self.handle = Some(handle);
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Converts the aufs markers under `root` into overlayfs markers in place.
///
/// Restricts the calling thread to `CAP_MKNOD` and `CAP_SYS_ADMIN` before walking, and raises
/// each only around the operation that needs it.
///
/// ## Examples
///
/// ```no_run
/// # fn main() -> ovlmark::OvlmarkResult<()> {
/// let stats = ovlmark::convert("/var/lib/layers/3f2a")?;
/// println!("{} whiteouts converted", stats.get_whiteouts());
/// # Ok(())
/// # }
/// ```
pub fn convert(root: impl AsRef<Path>) -> OvlmarkResult<ConversionStats> {
    let capabilities = CapabilityManager::init()?;
    Walker::new(Translator::new(capabilities)).walk(root)
}

/// Closes the outermost open handle while more than `limit` are open.
///
/// The innermost frame keeps its handle as long as `limit` is at least one.
fn release_handles(stack: &mut [Frame], limit: usize) {
    let mut open = stack.iter().filter(|f| f.handle.is_some()).count();
    for frame in stack.iter_mut() {
        if open <= limit.max(1) {
            break;
        }
        if frame.handle.take().is_some() {
            open -= 1;
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
