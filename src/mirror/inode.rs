use parking_lot::Mutex;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

/// (source inode number, source device). Unique among live objects of the
/// mirrored tree, but recycled by the source filesystem after deletion.
pub(crate) type SrcId = (libc::ino_t, libc::dev_t);

/// Counters that change after registration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Counts {
    /// Outstanding lookup grants held by the kernel.
    pub nlookup: u64,
    /// Live data descriptors derived from this inode.
    pub nopen: u64,
}

/// One managed record per distinct source object.
///
/// The identity descriptor is opened `O_PATH | O_NOFOLLOW` and lives exactly
/// as long as the record. It never changes after construction, so it is read
/// without taking `counts`.
#[derive(Debug)]
pub(crate) struct Inode {
    fd: OwnedFd,
    pub src: SrcId,
    pub generation: u64,
    pub counts: Mutex<Counts>,
}

impl Inode {
    pub fn new(fd: OwnedFd, src: SrcId, generation: u64, nlookup: u64) -> Self {
        Inode {
            fd,
            src,
            generation,
            counts: Mutex::new(Counts { nlookup, nopen: 0 }),
        }
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Grant one more lookup reference. Returns the new count.
    pub fn acquire(&self) -> u64 {
        let mut counts = self.counts.lock();
        counts.nlookup += 1;
        counts.nlookup
    }

    pub fn open_handle(&self) {
        self.counts.lock().nopen += 1;
    }

    pub fn close_handle(&self) {
        let mut counts = self.counts.lock();
        counts.nopen = counts.nopen.saturating_sub(1);
    }

    pub fn snapshot(&self) -> Counts {
        *self.counts.lock()
    }
}
