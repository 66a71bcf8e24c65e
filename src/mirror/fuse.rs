//! `fuser::Filesystem` front end.
//!
//! fuser reads requests on a single thread. Every upcall is handed to a
//! bounded pool of blocking workers together with its reply object, so
//! independent requests run concurrently against the shared [`MirrorFs`].

use fuser::consts::{FOPEN_CACHE_DIR, FOPEN_KEEP_CACHE};
use fuser::{
    fuse_forget_one, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyOpen, Request, TimeOrNow,
};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::runtime::{Builder, Runtime};

use crate::error::Result;
use crate::mirror::{MirrorFs, Opened, SetAttr};

/// Kernel may skip FLUSH on close.
const FOPEN_NOFLUSH: u32 = 1 << 5;

/// Sizing of the worker pool that executes upcalls.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    pub max_threads: usize,
    pub idle_timeout: Duration,
}

impl Default for WorkerPool {
    fn default() -> Self {
        WorkerPool {
            max_threads: 8,
            idle_timeout: Duration::from_secs(10),
        }
    }
}

pub struct FuseAdapter {
    fs: Arc<MirrorFs>,
    workers: Runtime,
}

impl FuseAdapter {
    pub fn new(fs: MirrorFs, pool: &WorkerPool) -> Result<Self> {
        let workers = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(pool.max_threads.max(1))
            .thread_keep_alive(pool.idle_timeout)
            .thread_name("mirrorfs-worker")
            .build()?;

        Ok(FuseAdapter {
            fs: Arc::new(fs),
            workers,
        })
    }

    pub fn filesystem(&self) -> Arc<MirrorFs> {
        Arc::clone(&self.fs)
    }

    fn dispatch<F>(&self, op: F)
    where
        F: FnOnce(&MirrorFs) + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        // Detached: the worker owns the reply and sends it exactly once.
        drop(self.workers.spawn_blocking(move || op(&fs)));
    }
}

fn open_flags(opened: &Opened, is_dir: bool) -> u32 {
    let mut flags = 0;
    if opened.keep_cache {
        flags |= FOPEN_KEEP_CACHE;
        if is_dir {
            flags |= FOPEN_CACHE_DIR;
        }
    }
    if opened.noflush {
        flags |= FOPEN_NOFLUSH;
    }
    flags
}

impl Filesystem for FuseAdapter {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        tracing::info!(
            "mirrorfs initialized for {} (timeout={:?})",
            self.fs.source().display(),
            self.fs.timeout()
        );
        Ok(())
    }

    fn destroy(&mut self) {
        self.fs.release_all();
        tracing::info!("mirrorfs destroyed");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_os_string();
        self.dispatch(move |fs| match fs.lookup(parent, &name) {
            Ok(entry) => reply.entry(&entry.ttl, &entry.attr, entry.generation),
            Err(e) => reply.error(super::log_fd_exhaustion(e) as i32),
        });
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.dispatch(move |fs| fs.forget(ino, nlookup));
    }

    fn batch_forget(&mut self, _req: &Request, nodes: &[fuse_forget_one]) {
        let forgets: Vec<(u64, u64)> = nodes.iter().map(|n| (n.nodeid, n.nlookup)).collect();
        self.dispatch(move |fs| fs.forget_many(&forgets));
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        self.dispatch(move |fs| match fs.getattr(ino) {
            Ok((attr, ttl)) => reply.attr(&ttl, &attr),
            Err(e) => reply.error(e as i32),
        });
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let attr = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
        };
        self.dispatch(move |fs| match fs.setattr(ino, &attr, fh) {
            Ok((attr, ttl)) => reply.attr(&ttl, &attr),
            Err(e) => reply.error(e as i32),
        });
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        self.dispatch(move |fs| match fs.open(ino, flags) {
            Ok(opened) => reply.opened(opened.fh, open_flags(&opened, false)),
            Err(e) => reply.error(e as i32),
        });
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.dispatch(move |fs| {
            fs.release(ino, fh);
            reply.ok();
        });
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = name.to_os_string();
        self.dispatch(move |fs| match fs.create(parent, &name, mode, flags) {
            Ok((entry, opened)) => reply.created(
                &entry.ttl,
                &entry.attr,
                entry.generation,
                opened.fh,
                open_flags(&opened, false),
            ),
            Err(e) => reply.error(e as i32),
        });
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        self.dispatch(move |fs| match fs.opendir(ino) {
            Ok(opened) => reply.opened(opened.fh, open_flags(&opened, true)),
            Err(e) => reply.error(e as i32),
        });
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        self.dispatch(move |fs| match fs.readdir(ino, fh, offset, &mut reply) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e as i32),
        });
    }

    fn readdirplus(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        self.dispatch(move |fs| match fs.readdirplus(ino, fh, offset, &mut reply) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e as i32),
        });
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.dispatch(move |fs| {
            fs.releasedir(fh);
            reply.ok();
        });
    }
}
