mod convert;
mod dir;
pub mod fuse;
mod inode;
pub mod mount;
mod sys;
mod table;

pub use dir::{dirent_size, direntplus_size, BufferedEntry, DirBuffer, DirPlusSink, DirSink};
pub use fuse::FuseAdapter;
pub use table::ROOT_HANDLE;

use convert::{dirent_type_to_filetype, stat_to_fileattr, time_or_now_to_timespec};
use dir::{is_dot_or_dotdot, DirSession};
use inode::Inode;
use table::InodeTable;

use fuser::{FileAttr, TimeOrNow};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::MirrorError;

/// Lookup count the root starts with. The kernel never forgets the root, and
/// lookups of `.`/`..` at the top only ever add to it.
const ROOT_NLOOKUP: u64 = u64::MAX / 2;

/// Result of resolving a name: what the kernel caches as a directory entry.
#[derive(Debug, Clone)]
pub struct Entry {
    pub handle: u64,
    pub generation: u64,
    pub attr: FileAttr,
    pub ttl: Duration,
}

/// A data descriptor handed out by `open`/`create`/`opendir`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opened {
    pub fh: u64,
    /// Kernel may keep cached pages (and, for directories, cached entries).
    pub keep_cache: bool,
    /// Kernel may skip the flush on close.
    pub noflush: bool,
}

/// Fields requested by a setattr call. `None` means "leave unchanged".
#[derive(Debug, Default, Clone)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
}

#[derive(Debug, Clone, Default)]
pub struct MirrorOptions {
    /// Attribute and entry cache timeout. Zero disables kernel caching.
    pub timeout: Duration,
}

#[derive(Debug)]
struct OpenFile {
    handle: u64,
    fd: OwnedFd,
}

/// Passthrough bookkeeping for one mirrored source tree.
///
/// Lock order: table, then inode. An inode lock is never held while taking
/// the table lock. Directory sessions have their own lock, taken before
/// either of the other two.
pub struct MirrorFs {
    source: PathBuf,
    src_dev: libc::dev_t,
    root: Arc<Inode>,
    table: Mutex<InodeTable>,
    files: RwLock<HashMap<u64, Arc<OpenFile>>>,
    dirs: RwLock<HashMap<u64, Arc<Mutex<DirSession>>>>,
    next_fh: Mutex<u64>,
    timeout: Duration,
}

impl MirrorFs {
    pub fn new(source: &Path, options: MirrorOptions) -> crate::error::Result<Self> {
        let meta = std::fs::symlink_metadata(source).map_err(|e| MirrorError::Source {
            path: source.to_path_buf(),
            reason: format!("Failed to stat source: {}", e),
        })?;
        if !meta.is_dir() {
            return Err(MirrorError::Source {
                path: source.to_path_buf(),
                reason: "Source is not a directory".to_string(),
            });
        }

        let fd = sys::open_path(source, libc::O_PATH).map_err(|e| MirrorError::Source {
            path: source.to_path_buf(),
            reason: format!("Failed to open source directory: {}", e),
        })?;
        let st = sys::stat_fd(fd.as_fd()).map_err(|e| MirrorError::Source {
            path: source.to_path_buf(),
            reason: format!("Failed to stat source directory: {}", e),
        })?;

        tracing::debug!(
            "source={} dev={} ino={}",
            source.display(),
            st.st_dev,
            st.st_ino
        );

        Ok(MirrorFs {
            source: source.to_path_buf(),
            src_dev: st.st_dev,
            root: Arc::new(Inode::new(fd, (st.st_ino, st.st_dev), 0, ROOT_NLOOKUP)),
            table: Mutex::new(InodeTable::new()),
            files: RwLock::new(HashMap::new()),
            dirs: RwLock::new(HashMap::new()),
            next_fh: Mutex::new(1),
            timeout: options.timeout,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn caching(&self) -> bool {
        !self.timeout.is_zero()
    }

    fn alloc_fh(&self) -> u64 {
        let mut next = self.next_fh.lock();
        let fh = *next;
        *next = next.wrapping_add(1);
        fh
    }

    /// Map a kernel handle to its inode.
    ///
    /// The kernel only presents handles it was given and has not forgotten;
    /// anything else means the identity table can no longer be trusted, so
    /// the process aborts.
    fn resolve(&self, handle: u64) -> Arc<Inode> {
        if handle == ROOT_HANDLE {
            return Arc::clone(&self.root);
        }
        match self.table.lock().get(handle) {
            Some(inode) => Arc::clone(inode),
            None => {
                tracing::error!("Unknown inode {}", handle);
                std::process::abort();
            }
        }
    }

    fn root_entry(&self) -> Result<Entry, Errno> {
        let st = sys::stat_fd(self.root.fd())?;
        let nlookup = self.root.acquire();
        tracing::debug!("lookup: root count {}", nlookup);
        Ok(Entry {
            handle: ROOT_HANDLE,
            generation: self.root.generation,
            attr: stat_to_fileattr(&st, ROOT_HANDLE),
            ttl: self.timeout,
        })
    }

    /// Resolve `name` under `parent` and grant the kernel one reference to it.
    pub fn lookup(&self, parent: u64, name: &OsStr) -> Result<Entry, Errno> {
        tracing::debug!("lookup(parent={}, name={:?})", parent, name);

        if parent == ROOT_HANDLE && is_dot_or_dotdot(name) {
            return self.root_entry();
        }

        let parent_inode = self.resolve(parent);
        let fd = sys::openat(
            parent_inode.fd(),
            name,
            libc::O_PATH | libc::O_NOFOLLOW,
            0,
        )?;
        let st = sys::stat_fd(fd.as_fd()).inspect_err(|_| {
            tracing::debug!("lookup: fstatat failed");
        })?;

        if st.st_dev != self.src_dev {
            tracing::warn!("Mountpoints in the source directory tree will be hidden.");
            return Err(Errno::ENOTSUP);
        }

        let src = (st.st_ino, st.st_dev);
        if src == self.root.src {
            return self.root_entry();
        }
        if st.st_ino as u64 == ROOT_HANDLE {
            tracing::error!("Source directory tree must not include {}", ROOT_HANDLE);
            std::process::abort();
        }

        let mut table = self.table.lock();
        if let Some((handle, inode)) = table.find(src) {
            // Counted under the table lock so a racing eviction cannot remove
            // the record between the find and the increment.
            let nlookup = inode.acquire();
            let generation = inode.generation;
            drop(table);
            tracing::debug!(
                "lookup: inode {} already known; handle={} count={}",
                st.st_ino,
                handle,
                nlookup
            );
            // `fd` is redundant now and closes here.
            return Ok(Entry {
                handle,
                generation,
                attr: stat_to_fileattr(&st, handle),
                ttl: self.timeout,
            });
        }

        let (handle, inode) = table.insert(fd, src)?;
        drop(table);
        tracing::debug!(
            "lookup: created inode {}; handle={} generation={}",
            st.st_ino,
            handle,
            inode.generation
        );

        Ok(Entry {
            handle,
            generation: inode.generation,
            attr: stat_to_fileattr(&st, handle),
            ttl: self.timeout,
        })
    }

    /// Drop `n` lookup references. The record is evicted once none remain.
    pub fn forget(&self, handle: u64, n: u64) {
        let inode = self.resolve(handle);

        let remaining = {
            let mut counts = inode.counts.lock();
            if n > counts.nlookup {
                tracing::error!("Negative lookup count for inode {}", inode.src.0);
                std::process::abort();
            }
            counts.nlookup -= n;
            counts.nlookup
        };

        tracing::debug!("forget: inode {} count {}", inode.src.0, remaining);
        if remaining > 0 || handle == ROOT_HANDLE {
            return;
        }

        let evicted = {
            let mut table = self.table.lock();
            // A lookup may have revived the record after the inode lock was
            // released; only evict if the count is still zero.
            if inode.snapshot().nlookup == 0 {
                table.remove(handle, &inode)
            } else {
                None
            }
        };

        if let Some(evicted) = evicted {
            tracing::debug!("forget: cleaning up inode {}", evicted.src.0);
        }
    }

    pub fn forget_many(&self, forgets: &[(u64, u64)]) {
        for &(handle, n) in forgets {
            self.forget(handle, n);
        }
    }

    fn attr_of(&self, handle: u64, inode: &Inode) -> Result<FileAttr, Errno> {
        let st = sys::stat_fd(inode.fd())?;
        Ok(stat_to_fileattr(&st, handle))
    }

    pub fn getattr(&self, handle: u64) -> Result<(FileAttr, Duration), Errno> {
        tracing::trace!("getattr(handle={})", handle);
        let inode = self.resolve(handle);
        Ok((self.attr_of(handle, &inode)?, self.timeout))
    }

    fn open_file(&self, fh: u64) -> Result<Arc<OpenFile>, Errno> {
        self.files.read().get(&fh).cloned().ok_or(Errno::EBADF)
    }

    /// Apply the requested fields in order (mode, owner, size, times),
    /// stopping at the first failure. Earlier changes are not rolled back.
    pub fn setattr(
        &self,
        handle: u64,
        attr: &SetAttr,
        fh: Option<u64>,
    ) -> Result<(FileAttr, Duration), Errno> {
        tracing::debug!("setattr(handle={}, fh={:?}, attr={:?})", handle, fh, attr);
        let inode = self.resolve(handle);
        let file = fh.map(|fh| self.open_file(fh)).transpose()?;
        let data_fd = file.as_ref().map(|f| f.fd.as_fd());

        if let Some(mode) = attr.mode {
            match data_fd {
                Some(fd) => sys::fchmod(fd, mode as libc::mode_t)?,
                None => sys::chmod_alias(inode.fd(), mode as libc::mode_t)?,
            }
        }

        if attr.uid.is_some() || attr.gid.is_some() {
            sys::chown_fd(inode.fd(), attr.uid, attr.gid)?;
        }

        if let Some(size) = attr.size {
            match data_fd {
                Some(fd) => sys::ftruncate(fd, size)?,
                None => sys::truncate_alias(inode.fd(), size)?,
            }
        }

        if attr.atime.is_some() || attr.mtime.is_some() {
            let atime = time_or_now_to_timespec(attr.atime);
            let mtime = time_or_now_to_timespec(attr.mtime);
            match data_fd {
                Some(fd) => sys::futimens(fd, &atime, &mtime)?,
                None => sys::utimens_alias(inode.fd(), &atime, &mtime)?,
            }
        }

        Ok((self.attr_of(handle, &inode)?, self.timeout))
    }

    /// Rewrite open flags for the kernel's writeback cache: it may read
    /// through a write-only handle and it enforces `O_APPEND` itself.
    fn writeback_flags(&self, flags: i32) -> i32 {
        if !self.caching() {
            return flags;
        }
        let mut oflags = OFlag::from_bits_retain(flags);
        if oflags & OFlag::O_ACCMODE == OFlag::O_WRONLY {
            oflags.remove(OFlag::O_ACCMODE);
            oflags.insert(OFlag::O_RDWR);
        }
        oflags.remove(OFlag::O_APPEND);
        oflags.bits()
    }

    fn register_file(&self, handle: u64, fd: OwnedFd) -> u64 {
        let fh = self.alloc_fh();
        self.files
            .write()
            .insert(fh, Arc::new(OpenFile { handle, fd }));
        fh
    }

    pub fn open(&self, handle: u64, flags: i32) -> Result<Opened, Errno> {
        tracing::debug!("open(handle={}, flags={:#x})", handle, flags);
        let inode = self.resolve(handle);
        let flags = self.writeback_flags(flags);

        // The identity descriptor is O_PATH and cannot carry data, so reopen
        // through its /proc alias.
        let fd = sys::open_alias(inode.fd(), flags).map_err(log_fd_exhaustion)?;

        inode.open_handle();
        let fh = self.register_file(handle, fd);
        Ok(Opened {
            fh,
            keep_cache: self.caching(),
            noflush: !self.caching() && (flags & libc::O_ACCMODE) == libc::O_RDONLY,
        })
    }

    pub fn create(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: i32,
    ) -> Result<(Entry, Opened), Errno> {
        tracing::debug!(
            "create(parent={}, name={:?}, mode={:#o}, flags={:#x})",
            parent,
            name,
            mode,
            flags
        );
        let parent_inode = self.resolve(parent);

        let fd = sys::openat(
            parent_inode.fd(),
            name,
            (flags | libc::O_CREAT) & !libc::O_NOFOLLOW,
            (mode & 0o7777) as libc::mode_t,
        )
        .map_err(log_fd_exhaustion)?;

        let entry = self.lookup(parent, name).map_err(log_fd_exhaustion)?;
        let inode = self.resolve(entry.handle);
        inode.open_handle();
        let fh = self.register_file(entry.handle, fd);

        Ok((
            entry,
            Opened {
                fh,
                keep_cache: false,
                noflush: false,
            },
        ))
    }

    /// Close a data descriptor. Always succeeds.
    pub fn release(&self, handle: u64, fh: u64) {
        tracing::debug!("release(handle={}, fh={})", handle, fh);
        let inode = self.resolve(handle);
        let Some(file) = self.files.write().remove(&fh) else {
            tracing::warn!("release: file handle {} not found", fh);
            return;
        };

        if file.handle == handle {
            inode.close_handle();
            return;
        }

        // The open count belongs to the inode the descriptor was opened on.
        tracing::warn!(
            "release: file handle {} belongs to inode {}, not {}",
            fh,
            file.handle,
            handle
        );
        match self.live(file.handle) {
            Some(owner) => owner.close_handle(),
            None => tracing::warn!("release: inode {} already forgotten", file.handle),
        }
    }

    pub fn opendir(&self, handle: u64) -> Result<Opened, Errno> {
        tracing::debug!("opendir(handle={})", handle);
        let inode = self.resolve(handle);
        let session = DirSession::open(inode.fd()).map_err(log_fd_exhaustion)?;

        let fh = self.alloc_fh();
        self.dirs.write().insert(fh, Arc::new(Mutex::new(session)));
        Ok(Opened {
            fh,
            keep_cache: self.caching(),
            noflush: false,
        })
    }

    fn dir_session(&self, fh: u64) -> Result<Arc<Mutex<DirSession>>, Errno> {
        self.dirs.read().get(&fh).cloned().ok_or(Errno::EBADF)
    }

    /// Fill `sink` with names and types, resuming at `offset`.
    /// Returns the number of entries added.
    pub fn readdir<S: DirSink>(
        &self,
        handle: u64,
        fh: u64,
        offset: i64,
        sink: &mut S,
    ) -> Result<usize, Errno> {
        tracing::debug!("readdir(handle={}, offset={})", handle, offset);
        let session = self.dir_session(fh)?;
        let mut session = session.lock();
        session.seek_to(offset);

        let mut count = 0;
        let mut failure = None;
        while let Some(next) = session.next_entry() {
            let raw = match next {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!("readdir: readdir failed with {}", e);
                    failure = Some(e);
                    break;
                }
            };
            if is_dot_or_dotdot(&raw.name) {
                continue;
            }
            if sink.push(
                raw.ino,
                raw.offset,
                dirent_type_to_filetype(raw.kind),
                &raw.name,
            ) {
                tracing::debug!("readdir: buffer full, returning data");
                break;
            }
            count += 1;
        }

        finish_enumeration(count, failure, session.offset())
    }

    /// Like [`readdir`](Self::readdir), but every returned entry is looked up
    /// and so carries one new lookup reference. An entry that does not fit
    /// gives its reference back.
    pub fn readdirplus<S: DirPlusSink>(
        &self,
        handle: u64,
        fh: u64,
        offset: i64,
        sink: &mut S,
    ) -> Result<usize, Errno> {
        tracing::debug!("readdirplus(handle={}, offset={})", handle, offset);
        let session = self.dir_session(fh)?;
        let mut session = session.lock();
        session.seek_to(offset);

        let mut count = 0;
        let mut failure = None;
        while let Some(next) = session.next_entry() {
            let raw = match next {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!("readdirplus: readdir failed with {}", e);
                    failure = Some(e);
                    break;
                }
            };
            if is_dot_or_dotdot(&raw.name) {
                continue;
            }

            let entry = match self.lookup(handle, &raw.name) {
                Ok(entry) => entry,
                // Hidden mountpoints, and names removed since the stream read
                // them. Plain readdir still lists both.
                Err(Errno::ENOTSUP) | Err(Errno::ENOENT) => continue,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };

            if sink.push(&entry, raw.offset, &raw.name) {
                tracing::debug!("readdirplus: buffer full, returning data");
                self.forget(entry.handle, 1);
                break;
            }
            count += 1;
        }

        finish_enumeration(count, failure, session.offset())
    }

    /// Drop a directory session and close its stream. Always succeeds.
    pub fn releasedir(&self, fh: u64) {
        tracing::debug!("releasedir(fh={})", fh);
        if self.dirs.write().remove(&fh).is_none() {
            tracing::warn!("releasedir: directory handle {} not found", fh);
        }
    }

    /// Close every open file and directory session.
    pub fn release_all(&self) {
        self.files.write().clear();
        self.dirs.write().clear();
    }

    /// Number of registered inodes, excluding the root.
    pub fn inode_count(&self) -> usize {
        self.table.lock().len()
    }

    fn live(&self, handle: u64) -> Option<Arc<Inode>> {
        if handle == ROOT_HANDLE {
            return Some(Arc::clone(&self.root));
        }
        self.table.lock().get(handle).cloned()
    }

    /// Outstanding lookup references for `handle`, `None` if not registered.
    pub fn lookup_count(&self, handle: u64) -> Option<u64> {
        self.live(handle).map(|inode| inode.snapshot().nlookup)
    }

    /// Open data descriptors for `handle`, `None` if not registered.
    pub fn open_count(&self, handle: u64) -> Option<u64> {
        self.live(handle).map(|inode| inode.snapshot().nopen)
    }
}

/// Once entries are in the reply their lookup references are granted, so a
/// late stream error is only reported when nothing was collected.
fn finish_enumeration(count: usize, failure: Option<Errno>, offset: i64) -> Result<usize, Errno> {
    match failure {
        Some(e) if count == 0 => Err(log_fd_exhaustion(e)),
        _ => {
            tracing::debug!("readdir: returning {} entries, curr offset {}", count, offset);
            Ok(count)
        }
    }
}

pub(crate) fn log_fd_exhaustion(err: Errno) -> Errno {
    if matches!(err, Errno::EMFILE | Errno::ENFILE) {
        tracing::error!("Reached maximum number of file descriptors");
    }
    err
}
