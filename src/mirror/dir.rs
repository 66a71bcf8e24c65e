use fuser::{FileType, ReplyDirectory, ReplyDirectoryPlus};
use nix::errno::Errno;
use std::ffi::{OsStr, OsString};
use std::os::fd::BorrowedFd;
use std::os::unix::ffi::OsStrExt;

use crate::mirror::sys::{DirStream, RawDirEntry};
use crate::mirror::Entry;

/// Per-opendir cursor: the stream plus the last stream position observed.
#[derive(Debug)]
pub(crate) struct DirSession {
    stream: DirStream,
    offset: i64,
}

impl DirSession {
    pub fn open(dir: BorrowedFd<'_>) -> Result<Self, Errno> {
        Ok(DirSession {
            stream: DirStream::open(dir)?,
            offset: 0,
        })
    }

    /// Reposition the stream if the caller resumes somewhere other than
    /// where the previous call stopped reading.
    pub fn seek_to(&mut self, offset: i64) {
        if offset != self.offset {
            tracing::debug!("readdir: seeking to {}", offset);
            self.stream.seek(offset);
            self.offset = offset;
        }
    }

    pub fn next_entry(&mut self) -> Option<Result<RawDirEntry, Errno>> {
        let entry = self.stream.next_entry()?;
        if let Ok(entry) = &entry {
            self.offset = entry.offset;
        }
        Some(entry)
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

pub(crate) fn is_dot_or_dotdot(name: &OsStr) -> bool {
    matches!(name.as_bytes(), b"." | b"..")
}

/// Destination for plain directory entries.
pub trait DirSink {
    /// Append one entry. Returns `true` if it did not fit; the entry is then
    /// not part of the reply.
    fn push(&mut self, ino: u64, offset: i64, kind: FileType, name: &OsStr) -> bool;
}

/// Destination for directory entries that carry a full lookup result.
pub trait DirPlusSink {
    /// Append one entry. Returns `true` if it did not fit; the entry is then
    /// not part of the reply.
    fn push(&mut self, entry: &Entry, offset: i64, name: &OsStr) -> bool;
}

impl DirSink for ReplyDirectory {
    fn push(&mut self, ino: u64, offset: i64, kind: FileType, name: &OsStr) -> bool {
        self.add(ino, offset, kind, name)
    }
}

impl DirPlusSink for ReplyDirectoryPlus {
    fn push(&mut self, entry: &Entry, offset: i64, name: &OsStr) -> bool {
        self.add(
            entry.handle,
            offset,
            name,
            &entry.ttl,
            &entry.attr,
            entry.generation,
        )
    }
}

const DIRENT_HEADER: usize = 24;
const ENTRY_OUT: usize = 128;

fn align8(len: usize) -> usize {
    (len + 7) & !7
}

/// Wire size of a `fuse_dirent` record.
pub fn dirent_size(name: &OsStr) -> usize {
    align8(DIRENT_HEADER + name.len())
}

/// Wire size of a `fuse_direntplus` record.
pub fn direntplus_size(name: &OsStr) -> usize {
    align8(ENTRY_OUT + DIRENT_HEADER + name.len())
}

/// One entry accepted by a [`DirBuffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedEntry {
    pub name: OsString,
    pub ino: u64,
    pub offset: i64,
    pub kind: FileType,
    pub generation: u64,
}

/// In-memory reply buffer with the same byte accounting as the kernel's
/// readdir buffer. Used when the caller is not the FUSE channel.
#[derive(Debug)]
pub struct DirBuffer {
    remaining: usize,
    entries: Vec<BufferedEntry>,
}

impl DirBuffer {
    pub fn new(capacity: usize) -> Self {
        DirBuffer {
            remaining: capacity,
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[BufferedEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<BufferedEntry> {
        self.entries
    }

    fn reserve(&mut self, size: usize) -> bool {
        if size > self.remaining {
            return false;
        }
        self.remaining -= size;
        true
    }
}

impl DirSink for DirBuffer {
    fn push(&mut self, ino: u64, offset: i64, kind: FileType, name: &OsStr) -> bool {
        if !self.reserve(dirent_size(name)) {
            return true;
        }
        self.entries.push(BufferedEntry {
            name: name.to_os_string(),
            ino,
            offset,
            kind,
            generation: 0,
        });
        false
    }
}

impl DirPlusSink for DirBuffer {
    fn push(&mut self, entry: &Entry, offset: i64, name: &OsStr) -> bool {
        if !self.reserve(direntplus_size(name)) {
            return true;
        }
        self.entries.push(BufferedEntry {
            name: name.to_os_string(),
            ino: entry.handle,
            offset,
            kind: entry.attr.kind,
            generation: entry.generation,
        });
        false
    }
}
