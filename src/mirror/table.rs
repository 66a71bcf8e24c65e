use fxhash::FxHashMap;
use nix::errno::Errno;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use crate::mirror::inode::{Inode, SrcId};

/// Handle the kernel uses for the mount's root directory.
pub const ROOT_HANDLE: u64 = fuser::FUSE_ROOT_ID;

/// Low halves 0 and 1 are never produced, so no handle can collide with
/// the kernel's "no node" value or with `ROOT_HANDLE`.
const INDEX_BASE: u64 = 2;
const INDEX_MASK: u64 = 0xffff_ffff;
const MAX_SLOTS: usize = (u32::MAX as u64 - INDEX_BASE) as usize;

/// Compose an opaque handle from a slot index and that slot's tag.
pub(crate) fn encode_handle(index: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | (index as u64 + INDEX_BASE)
}

pub(crate) fn decode_handle(handle: u64) -> Option<(u32, u32)> {
    let low = handle & INDEX_MASK;
    if low < INDEX_BASE {
        return None;
    }
    Some(((low - INDEX_BASE) as u32, (handle >> 32) as u32))
}

#[derive(Debug, Default)]
struct Slot {
    /// Bumped every time the slot is vacated, so handles minted for a
    /// previous occupant stop resolving.
    tag: u32,
    inode: Option<Arc<Inode>>,
}

/// Identity table: source identity -> managed inode, addressed by handles
/// that encode a slot index and the slot's tag.
///
/// The root inode is not stored here; it is pinned by the filesystem.
#[derive(Debug)]
pub(crate) struct InodeTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_src: FxHashMap<SrcId, u32>,
    next_generation: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        InodeTable {
            slots: Vec::new(),
            free: Vec::new(),
            by_src: FxHashMap::default(),
            next_generation: 1,
        }
    }

    pub fn get(&self, handle: u64) -> Option<&Arc<Inode>> {
        let (index, tag) = decode_handle(handle)?;
        let slot = self.slots.get(index as usize)?;
        if slot.tag != tag {
            return None;
        }
        slot.inode.as_ref()
    }

    pub fn find(&self, src: SrcId) -> Option<(u64, &Arc<Inode>)> {
        let index = *self.by_src.get(&src)?;
        let slot = &self.slots[index as usize];
        slot.inode
            .as_ref()
            .map(|inode| (encode_handle(index, slot.tag), inode))
    }

    /// Register a new identity with one lookup reference already granted.
    ///
    /// The record is fully built before it becomes reachable, so nobody can
    /// observe a half-installed inode. On allocation failure `fd` is closed
    /// and `ENOMEM` returned.
    pub fn insert(&mut self, fd: OwnedFd, src: SrcId) -> Result<(u64, Arc<Inode>), Errno> {
        self.by_src.try_reserve(1).map_err(|_| Errno::ENOMEM)?;
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= MAX_SLOTS {
                    return Err(Errno::ENOMEM);
                }
                self.slots.try_reserve(1).map_err(|_| Errno::ENOMEM)?;
                self.free.try_reserve(1).map_err(|_| Errno::ENOMEM)?;
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };

        let generation = self.next_generation;
        self.next_generation += 1;

        let inode = Arc::new(Inode::new(fd, src, generation, 1));
        let slot = &mut self.slots[index as usize];
        slot.inode = Some(Arc::clone(&inode));
        self.by_src.insert(src, index);

        Ok((encode_handle(index, slot.tag), inode))
    }

    /// Vacate the slot behind `handle` if it still holds `expected`.
    ///
    /// The removed record is handed back so the caller can drop it (and close
    /// its descriptor) after releasing the table lock.
    pub fn remove(&mut self, handle: u64, expected: &Arc<Inode>) -> Option<Arc<Inode>> {
        let (index, tag) = decode_handle(handle)?;
        let slot = self.slots.get_mut(index as usize)?;
        if slot.tag != tag || !slot.inode.as_ref().is_some_and(|i| Arc::ptr_eq(i, expected)) {
            return None;
        }

        let inode = slot.inode.take()?;
        slot.tag = slot.tag.wrapping_add(1);
        self.free.push(index);
        self.by_src.remove(&inode.src);
        Some(inode)
    }

    pub fn len(&self) -> usize {
        self.by_src.len()
    }
}
