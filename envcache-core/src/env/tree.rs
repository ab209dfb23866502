//! Directory tree walking
//!
//! Size accounting and recursive cleanup both walk a tree, classify every
//! entry without following symlinks, and fold or act per node. The walk is
//! written once ([`walk`]) and the two operations are visitors over it.

use std::fs::{self, Metadata, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::{debug, warn};

/// Classification of a non-directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    /// Symlinks, sockets, fifos, devices.
    Other,
}

/// Per-node callbacks for [`walk`].
pub trait Visitor {
    /// Called for every non-directory entry.
    fn leaf(&mut self, path: &Path, kind: EntryKind, meta: &Metadata) -> io::Result<()>;

    /// Called before the subdirectory `path` is listed.
    fn enter_dir(&mut self, _path: &Path, _meta: &Metadata) -> io::Result<()> {
        Ok(())
    }

    /// Called after all entries of the subdirectory `path` were visited.
    fn leave_dir(&mut self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    /// Called when a directory cannot be listed or an entry cannot be
    /// stat'ed. Returning `Ok` skips it; returning an error aborts the walk.
    fn unreadable(&mut self, _path: &Path, err: io::Error) -> io::Result<()> {
        Err(err)
    }
}

/// Visit everything below `root`, children before their parent directory.
/// `root` itself is listed but not passed to [`Visitor::enter_dir`] or
/// [`Visitor::leave_dir`].
pub fn walk<V: Visitor + ?Sized>(root: &Path, visitor: &mut V) -> io::Result<()> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => return visitor.unreadable(root, e),
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                visitor.unreadable(root, e)?;
                continue;
            }
        };
        let path = entry.path();
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) => {
                visitor.unreadable(&path, e)?;
                continue;
            }
        };

        if meta.is_dir() {
            visitor.enter_dir(&path, &meta)?;
            walk(&path, visitor)?;
            visitor.leave_dir(&path)?;
        } else if meta.is_file() {
            visitor.leaf(&path, EntryKind::File, &meta)?;
        } else {
            visitor.leaf(&path, EntryKind::Other, &meta)?;
        }
    }
    Ok(())
}

/// Sums regular file sizes; unreadable parts count as empty.
#[derive(Debug, Default)]
struct SizeSum {
    total: u64,
}

impl Visitor for SizeSum {
    fn leaf(&mut self, _path: &Path, kind: EntryKind, meta: &Metadata) -> io::Result<()> {
        if kind == EntryKind::File {
            self.total += meta.len();
        }
        Ok(())
    }

    fn unreadable(&mut self, path: &Path, err: io::Error) -> io::Result<()> {
        if err.kind() != io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %err, "Skipping unreadable entry");
        }
        Ok(())
    }
}

/// Total size in bytes of all regular files below `path`.
///
/// Symlinks are not followed. A path that cannot be opened yields 0.
pub fn sum_dir(path: &Path) -> u64 {
    let mut sum = SizeSum::default();
    // SizeSum never aborts the walk
    let _ = walk(path, &mut sum);
    sum.total
}

/// Unlinks files and removes directories once emptied.
struct Clear;

impl Visitor for Clear {
    fn leaf(&mut self, path: &Path, _kind: EntryKind, _meta: &Metadata) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn leave_dir(&mut self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }
}

/// Remove everything below `dir`, keeping `dir` itself.
///
/// Stops at the first error; a partially cleared tree is reported as a
/// failure.
pub fn clear_dir(dir: &Path) -> io::Result<()> {
    walk(dir, &mut Clear).map_err(|e| {
        warn!(dir = %dir.display(), error = %e, "Failed to clear directory");
        e
    })
}

/// Grants the owner rwx on every directory it enters.
struct OwnerWritable;

impl OwnerWritable {
    fn grant(path: &Path, meta: &Metadata) {
        let mode = meta.permissions().mode() & 0o7777;
        if mode & 0o700 == 0o700 {
            return;
        }
        if let Err(e) = fs::set_permissions(path, Permissions::from_mode(mode | 0o700)) {
            debug!(path = %path.display(), error = %e, "chmod failed");
        }
    }
}

impl Visitor for OwnerWritable {
    fn leaf(&mut self, _path: &Path, _kind: EntryKind, _meta: &Metadata) -> io::Result<()> {
        Ok(())
    }

    fn enter_dir(&mut self, path: &Path, meta: &Metadata) -> io::Result<()> {
        Self::grant(path, meta);
        Ok(())
    }

    fn unreadable(&mut self, _path: &Path, _err: io::Error) -> io::Result<()> {
        Ok(())
    }
}

/// Give the owner write and search permission on `dir` and every
/// directory below it, so that nothing in the tree blocks unlinking.
///
/// Best effort: entries that cannot be changed are left as they are.
pub fn make_removable(dir: &Path) {
    match fs::symlink_metadata(dir) {
        Ok(meta) if meta.is_dir() => OwnerWritable::grant(dir, &meta),
        _ => return,
    }
    // OwnerWritable never aborts the walk
    let _ = walk(dir, &mut OwnerWritable);
}
