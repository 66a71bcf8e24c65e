mod common;

use common::TestMirror;
use fuser::FileType;
use mirrorfs::{MirrorFs, MirrorOptions, ROOT_HANDLE};
use nix::errno::Errno;
use std::ffi::OsStr;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn test_lookup_registers_and_forget_evicts() {
    let mirror = TestMirror::new();
    mirror.write("a.txt", "hello");

    let entry = mirror.fs.lookup(ROOT_HANDLE, OsStr::new("a.txt")).unwrap();
    assert_ne!(entry.handle, ROOT_HANDLE);
    assert_eq!(entry.attr.ino, entry.handle);
    assert_eq!(entry.attr.kind, FileType::RegularFile);
    assert_eq!(entry.attr.size, 5);
    assert_eq!(mirror.fs.inode_count(), 1);
    assert_eq!(mirror.fs.lookup_count(entry.handle), Some(1));

    let again = mirror.fs.lookup(ROOT_HANDLE, OsStr::new("a.txt")).unwrap();
    assert_eq!(again.handle, entry.handle);
    assert_eq!(again.generation, entry.generation);
    assert_eq!(mirror.fs.lookup_count(entry.handle), Some(2));

    mirror.fs.forget(entry.handle, 1);
    assert_eq!(mirror.fs.lookup_count(entry.handle), Some(1));
    assert_eq!(mirror.fs.inode_count(), 1);

    mirror.fs.forget(entry.handle, 1);
    assert_eq!(mirror.fs.lookup_count(entry.handle), None);
    assert_eq!(mirror.fs.inode_count(), 0);
}

#[test]
fn test_forget_many_drops_each_count() {
    let mirror = TestMirror::new();
    mirror.write("a", "");
    mirror.write("b", "");

    let a = mirror.lookup("a");
    let b = mirror.lookup("b");
    mirror.lookup("b");
    assert_eq!(mirror.fs.inode_count(), 2);

    mirror.fs.forget_many(&[(a, 1), (b, 1)]);
    assert_eq!(mirror.fs.lookup_count(a), None);
    assert_eq!(mirror.fs.lookup_count(b), Some(1));

    mirror.fs.forget_many(&[(b, 1)]);
    assert_eq!(mirror.fs.inode_count(), 0);
}

#[test]
fn test_lookup_missing_name_is_enoent() {
    let mirror = TestMirror::new();
    mirror.write("present", "");
    mirror.lookup("present");

    let err = mirror
        .fs
        .lookup(ROOT_HANDLE, OsStr::new("missing"))
        .unwrap_err();
    assert_eq!(err, Errno::ENOENT);
    assert_eq!(mirror.fs.inode_count(), 1);
}

#[test]
fn test_lookup_nested_path() {
    let mirror = TestMirror::new();
    mirror.write("dir/sub/file", "data");

    let dir = mirror.lookup("dir");
    let sub = mirror.fs.lookup(dir, OsStr::new("sub")).unwrap();
    assert_eq!(sub.attr.kind, FileType::Directory);

    let file = mirror.fs.lookup(sub.handle, OsStr::new("file")).unwrap();
    assert_eq!(file.attr.size, 4);
    assert_eq!(mirror.fs.inode_count(), 3);

    // Walking back up reaches the already registered parent.
    let up = mirror.fs.lookup(sub.handle, OsStr::new("..")).unwrap();
    assert_eq!(up.handle, dir);
    assert_eq!(mirror.fs.lookup_count(dir), Some(2));
}

#[test]
fn test_lookup_of_parent_of_top_level_dir_is_root() {
    let mirror = TestMirror::new();
    mirror.mkdir("dir");

    let dir = mirror.lookup("dir");
    let up = mirror.fs.lookup(dir, OsStr::new("..")).unwrap();
    assert_eq!(up.handle, ROOT_HANDLE);
    assert_eq!(up.attr.ino, ROOT_HANDLE);
    assert_eq!(mirror.fs.inode_count(), 1);
}

#[test]
fn test_symlink_is_not_followed() {
    let mirror = TestMirror::new();
    mirror.write("target", "0123456789");
    std::os::unix::fs::symlink("target", mirror.path().join("link")).unwrap();

    let link = mirror.fs.lookup(ROOT_HANDLE, OsStr::new("link")).unwrap();
    let target = mirror.fs.lookup(ROOT_HANDLE, OsStr::new("target")).unwrap();

    assert_eq!(link.attr.kind, FileType::Symlink);
    assert_ne!(link.handle, target.handle);
    assert_eq!(mirror.fs.inode_count(), 2);
}

#[test]
fn test_hard_links_share_one_record() {
    let mirror = TestMirror::new();
    let original = mirror.write("original", "x");
    std::fs::hard_link(&original, mirror.path().join("alias")).unwrap();

    let a = mirror.lookup("original");
    let b = mirror.lookup("alias");

    assert_eq!(a, b);
    assert_eq!(mirror.fs.lookup_count(a), Some(2));
    assert_eq!(mirror.fs.inode_count(), 1);
}

#[test]
fn test_concurrent_first_lookups_share_one_record() {
    const THREADS: usize = 8;

    let temp_dir = tempfile::tempdir().unwrap();
    std::fs::write(temp_dir.path().join("shared"), "").unwrap();
    let fs = Arc::new(MirrorFs::new(temp_dir.path(), MirrorOptions::default()).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let fs = Arc::clone(&fs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                fs.lookup(ROOT_HANDLE, OsStr::new("shared")).unwrap().handle
            })
        })
        .collect();

    let handles: Vec<u64> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert!(handles.iter().all(|&h| h == handles[0]));
    assert_eq!(fs.lookup_count(handles[0]), Some(THREADS as u64));
    assert_eq!(fs.inode_count(), 1);
}

#[test]
fn test_concurrent_lookup_and_forget_keep_counts_balanced() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 200;

    let temp_dir = tempfile::tempdir().unwrap();
    std::fs::write(temp_dir.path().join("churn"), "").unwrap();
    let fs = Arc::new(MirrorFs::new(temp_dir.path(), MirrorOptions::default()).unwrap());

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let entry = fs.lookup(ROOT_HANDLE, OsStr::new("churn")).unwrap();
                    fs.forget(entry.handle, 1);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(fs.inode_count(), 0);
}

#[test]
fn test_generation_increases_after_eviction() {
    let mirror = TestMirror::new();
    let path = mirror.write("recycled", "first");

    let first = mirror.fs.lookup(ROOT_HANDLE, OsStr::new("recycled")).unwrap();
    mirror.fs.forget(first.handle, 1);
    assert_eq!(mirror.fs.inode_count(), 0);

    std::fs::remove_file(&path).unwrap();
    mirror.write("recycled", "second");

    let second = mirror.fs.lookup(ROOT_HANDLE, OsStr::new("recycled")).unwrap();
    assert!(second.generation > first.generation);
    assert_ne!(second.handle, first.handle);
}

#[test]
fn test_cross_device_entry_is_hidden() {
    let root = Path::new("/");
    let proc_dir = Path::new("/proc");
    let (Ok(root_meta), Ok(proc_meta)) = (
        std::fs::symlink_metadata(root),
        std::fs::symlink_metadata(proc_dir),
    ) else {
        eprintln!("Skipping cross-device test - /proc not available");
        return;
    };
    if root_meta.dev() == proc_meta.dev() {
        eprintln!("Skipping cross-device test - /proc on the root device");
        return;
    }

    let fs = MirrorFs::new(root, MirrorOptions::default()).unwrap();
    let err = fs.lookup(ROOT_HANDLE, OsStr::new("proc")).unwrap_err();
    assert_eq!(err, Errno::ENOTSUP);
    assert_eq!(fs.inode_count(), 0);
}

#[test]
fn test_root_attributes_use_root_id() {
    let mirror = TestMirror::new();
    let (attr, ttl) = mirror.fs.getattr(ROOT_HANDLE).unwrap();
    assert_eq!(attr.ino, ROOT_HANDLE);
    assert_eq!(attr.kind, FileType::Directory);
    assert!(ttl.is_zero());
}
