//! Thin wrappers over the `*at` family of system calls.
//!
//! Every wrapper returns `nix::errno::Errno` on failure so callers can hand the
//! code straight back to the kernel. Descriptors are returned as `OwnedFd` and
//! are closed exactly once, on drop.

use nix::errno::Errno;
use nix::fcntl::{self, AtFlags, OFlag};
use nix::sys::stat::{self, FchmodatFlags, FileStat, Mode, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::{self, Gid, Uid};
use std::ffi::{CStr, OsStr, OsString};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

fn owned(fd: RawFd) -> OwnedFd {
    // nix hands back a freshly opened descriptor that nothing else owns.
    unsafe { OwnedFd::from_raw_fd(fd) }
}

fn file_offset(size: u64) -> Result<libc::off_t, Errno> {
    libc::off_t::try_from(size).map_err(|_| Errno::EFBIG)
}

/// Path under `/proc/self/fd` that aliases `fd`.
///
/// `O_PATH` descriptors refuse data access and `fchmod`, but re-opening or
/// operating on the alias path reaches the same object without following
/// any symlink in the mirrored tree.
pub(crate) fn proc_alias(fd: BorrowedFd<'_>) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{}", fd.as_raw_fd()))
}

pub(crate) fn open_path(path: &Path, flags: libc::c_int) -> Result<OwnedFd, Errno> {
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_CLOEXEC;
    fcntl::open(path, flags, Mode::empty()).map(owned)
}

pub(crate) fn openat(
    dir: BorrowedFd<'_>,
    name: &OsStr,
    flags: libc::c_int,
    mode: libc::mode_t,
) -> Result<OwnedFd, Errno> {
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_CLOEXEC;
    fcntl::openat(
        Some(dir.as_raw_fd()),
        name,
        flags,
        Mode::from_bits_truncate(mode),
    )
    .map(owned)
}

/// Re-open the object behind an identity descriptor for data access.
pub(crate) fn open_alias(fd: BorrowedFd<'_>, flags: libc::c_int) -> Result<OwnedFd, Errno> {
    let mut flags = OFlag::from_bits_retain(flags) | OFlag::O_CLOEXEC;
    flags.remove(OFlag::O_NOFOLLOW);
    fcntl::open(&proc_alias(fd), flags, Mode::empty()).map(owned)
}

/// `fstatat(fd, "", AT_EMPTY_PATH | AT_SYMLINK_NOFOLLOW)`
pub(crate) fn stat_fd(fd: BorrowedFd<'_>) -> Result<FileStat, Errno> {
    stat::fstatat(
        Some(fd.as_raw_fd()),
        "",
        AtFlags::AT_EMPTY_PATH | AtFlags::AT_SYMLINK_NOFOLLOW,
    )
}

pub(crate) fn fchmod(fd: BorrowedFd<'_>, mode: libc::mode_t) -> Result<(), Errno> {
    stat::fchmod(fd.as_raw_fd(), Mode::from_bits_truncate(mode))
}

pub(crate) fn chmod_alias(fd: BorrowedFd<'_>, mode: libc::mode_t) -> Result<(), Errno> {
    stat::fchmodat(
        None,
        &proc_alias(fd),
        Mode::from_bits_truncate(mode),
        FchmodatFlags::FollowSymlink,
    )
}

/// Change ownership without following symlinks. `None` leaves a component
/// untouched.
pub(crate) fn chown_fd(
    fd: BorrowedFd<'_>,
    uid: Option<libc::uid_t>,
    gid: Option<libc::gid_t>,
) -> Result<(), Errno> {
    unistd::fchownat(
        Some(fd.as_raw_fd()),
        "",
        uid.map(Uid::from_raw),
        gid.map(Gid::from_raw),
        AtFlags::AT_EMPTY_PATH | AtFlags::AT_SYMLINK_NOFOLLOW,
    )
}

pub(crate) fn ftruncate(fd: BorrowedFd<'_>, size: u64) -> Result<(), Errno> {
    unistd::ftruncate(fd, file_offset(size)?)
}

pub(crate) fn truncate_alias(fd: BorrowedFd<'_>, size: u64) -> Result<(), Errno> {
    unistd::truncate(&proc_alias(fd), file_offset(size)?)
}

pub(crate) fn futimens(fd: BorrowedFd<'_>, atime: &TimeSpec, mtime: &TimeSpec) -> Result<(), Errno> {
    stat::futimens(fd.as_raw_fd(), atime, mtime)
}

pub(crate) fn utimens_alias(
    fd: BorrowedFd<'_>,
    atime: &TimeSpec,
    mtime: &TimeSpec,
) -> Result<(), Errno> {
    stat::utimensat(
        None,
        &proc_alias(fd),
        atime,
        mtime,
        UtimensatFlags::FollowSymlink,
    )
}

/// One record read from a directory stream.
#[derive(Debug, Clone)]
pub(crate) struct RawDirEntry {
    pub name: OsString,
    pub ino: u64,
    /// Stream position just past this entry, as reported by the filesystem.
    pub offset: i64,
    pub kind: u8,
}

/// An open `DIR*`, closed on drop.
#[derive(Debug)]
pub(crate) struct DirStream {
    dirp: NonNull<libc::DIR>,
}

// The stream is only ever touched through `&mut self`.
unsafe impl Send for DirStream {}

impl DirStream {
    /// Open a fresh stream on the directory behind `dir`. The stream gets its
    /// own descriptor; `dir` is left untouched.
    pub fn open(dir: BorrowedFd<'_>) -> Result<Self, Errno> {
        let fd = openat(
            dir,
            OsStr::new("."),
            libc::O_RDONLY | libc::O_DIRECTORY,
            0,
        )?;
        let dirp = unsafe { libc::fdopendir(fd.as_raw_fd()) };
        match NonNull::new(dirp) {
            Some(dirp) => {
                // Ownership moved into the DIR*; closedir releases it.
                let _ = fd.into_raw_fd();
                Ok(DirStream { dirp })
            }
            None => Err(Errno::last()),
        }
    }

    pub fn seek(&mut self, offset: i64) {
        unsafe { libc::seekdir(self.dirp.as_ptr(), offset as libc::c_long) }
    }

    /// Next entry, `None` at end of stream.
    pub fn next_entry(&mut self) -> Option<Result<RawDirEntry, Errno>> {
        // readdir reports end of stream and failure the same way; only a
        // changed errno tells them apart.
        Errno::clear();
        let entry = unsafe { libc::readdir(self.dirp.as_ptr()) };
        if entry.is_null() {
            return match Errno::last_raw() {
                0 => None,
                _ => Some(Err(Errno::last())),
            };
        }

        let entry = unsafe { &*entry };
        let name = unsafe { CStr::from_ptr(entry.d_name.as_ptr()) };
        Some(Ok(RawDirEntry {
            name: OsString::from_vec(name.to_bytes().to_vec()),
            ino: entry.d_ino as u64,
            offset: entry.d_off as i64,
            kind: entry.d_type,
        }))
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.dirp.as_ptr()) };
    }
}
