mod common;

use common::{names, TestMirror};
use fuser::FileType;
use mirrorfs::mirror::{direntplus_size, DirBuffer};
use mirrorfs::ROOT_HANDLE;
use nix::errno::Errno;
use rstest::rstest;
use std::ffi::OsStr;

fn populate(mirror: &TestMirror, count: usize) -> Vec<String> {
    let mut expected: Vec<String> = (0..count).map(|i| format!("f{:02}", i)).collect();
    for name in &expected {
        mirror.write(name, name);
    }
    mirror.mkdir("zdir");
    expected.push("zdir".to_string());
    expected.sort();
    expected
}

#[test]
fn test_readdir_skips_dot_entries_and_reports_types() {
    let mirror = TestMirror::new();
    mirror.write("file", "");
    mirror.mkdir("dir");
    std::os::unix::fs::symlink("file", mirror.path().join("link")).unwrap();

    let entries = mirror.readdir_chunked(ROOT_HANDLE, usize::MAX);
    assert_eq!(names(&entries), vec!["dir", "file", "link"]);

    let kind_of = |name: &str| {
        entries
            .iter()
            .find(|e| e.name == OsStr::new(name))
            .map(|e| e.kind)
            .unwrap()
    };
    assert_eq!(kind_of("dir"), FileType::Directory);
    assert_eq!(kind_of("file"), FileType::RegularFile);
    assert_eq!(kind_of("link"), FileType::Symlink);

    // Plain enumeration grants no references.
    assert_eq!(mirror.fs.inode_count(), 0);
}

#[rstest]
#[case(32)]
#[case(64)]
#[case(100)]
#[case(4096)]
fn test_readdir_resume_matches_unbounded(#[case] capacity: usize) {
    let mirror = TestMirror::new();
    let expected = populate(&mirror, 20);

    let unbounded = mirror.readdir_chunked(ROOT_HANDLE, usize::MAX);
    let chunked = mirror.readdir_chunked(ROOT_HANDLE, capacity);

    assert_eq!(names(&unbounded), expected);
    assert_eq!(names(&chunked), expected);
    assert_eq!(chunked.len(), expected.len());
}

#[test]
fn test_readdir_of_subdirectory() {
    let mirror = TestMirror::new();
    mirror.write("sub/one", "");
    mirror.write("sub/two", "");
    mirror.write("other", "");

    let sub = mirror.lookup("sub");
    let entries = mirror.readdir_chunked(sub, usize::MAX);
    assert_eq!(names(&entries), vec!["one", "two"]);
}

#[test]
fn test_readdirplus_counts_only_returned_entries() {
    let mirror = TestMirror::new();
    for name in ["a", "b", "c", "d", "e"] {
        mirror.write(name, "");
    }

    let dir = mirror.fs.opendir(ROOT_HANDLE).unwrap();
    // Room for two single-character entries, not three.
    let capacity = 2 * direntplus_size(OsStr::new("a")) + 8;
    let mut buf = DirBuffer::new(capacity);
    let count = mirror
        .fs
        .readdirplus(ROOT_HANDLE, dir.fh, 0, &mut buf)
        .unwrap();

    assert_eq!(count, 2);
    let returned = buf.into_entries();
    for entry in &returned {
        assert_eq!(mirror.fs.lookup_count(entry.ino), Some(1));
        assert!(entry.generation > 0);
    }
    // The entry that was resolved but did not fit was given back.
    assert_eq!(mirror.fs.inode_count(), 2);

    mirror.fs.releasedir(dir.fh);
}

#[test]
fn test_readdirplus_resume_returns_every_entry_once() {
    let mirror = TestMirror::new();
    let expected = populate(&mirror, 12);

    let dir = mirror.fs.opendir(ROOT_HANDLE).unwrap();
    let capacity = 3 * direntplus_size(OsStr::new("f00"));
    let mut offset = 0;
    let mut all = Vec::new();
    loop {
        let mut buf = DirBuffer::new(capacity);
        mirror
            .fs
            .readdirplus(ROOT_HANDLE, dir.fh, offset, &mut buf)
            .unwrap();
        let entries = buf.into_entries();
        match entries.last() {
            Some(last) => offset = last.offset,
            None => break,
        }
        all.extend(entries);
    }
    mirror.fs.releasedir(dir.fh);

    assert_eq!(names(&all), expected);
    assert_eq!(mirror.fs.inode_count(), expected.len());
    for entry in &all {
        assert_eq!(mirror.fs.lookup_count(entry.ino), Some(1));
    }
}

#[test]
fn test_readdirplus_entries_match_lookup() {
    let mirror = TestMirror::new();
    mirror.write("file", "abc");

    let dir = mirror.fs.opendir(ROOT_HANDLE).unwrap();
    let mut buf = DirBuffer::new(usize::MAX);
    mirror
        .fs
        .readdirplus(ROOT_HANDLE, dir.fh, 0, &mut buf)
        .unwrap();
    mirror.fs.releasedir(dir.fh);

    let listed = &buf.entries()[0];
    let looked_up = mirror.fs.lookup(ROOT_HANDLE, OsStr::new("file")).unwrap();
    assert_eq!(listed.ino, looked_up.handle);
    assert_eq!(listed.generation, looked_up.generation);
    assert_eq!(mirror.fs.lookup_count(looked_up.handle), Some(2));
}

#[test]
fn test_released_directory_handle_is_ebadf() {
    let mirror = TestMirror::new();
    let dir = mirror.fs.opendir(ROOT_HANDLE).unwrap();
    mirror.fs.releasedir(dir.fh);

    let mut buf = DirBuffer::new(usize::MAX);
    let err = mirror
        .fs
        .readdir(ROOT_HANDLE, dir.fh, 0, &mut buf)
        .unwrap_err();
    assert_eq!(err, Errno::EBADF);
}

#[rstest]
#[case(0, false)]
#[case(1, true)]
fn test_opendir_cache_flags(#[case] timeout_secs: u64, #[case] caching: bool) {
    let mirror = TestMirror::with_timeout(std::time::Duration::from_secs(timeout_secs));
    let dir = mirror.fs.opendir(ROOT_HANDLE).unwrap();
    assert_eq!(dir.keep_cache, caching);
    assert!(!dir.noflush);
    mirror.fs.releasedir(dir.fh);
}

#[test]
fn test_hidden_mountpoint_listed_by_readdir_only() {
    use mirrorfs::{MirrorFs, MirrorOptions};
    use std::os::unix::fs::MetadataExt;
    use std::path::Path;

    let root = Path::new("/");
    let (Ok(root_meta), Ok(proc_meta)) = (
        std::fs::symlink_metadata(root),
        std::fs::symlink_metadata("/proc"),
    ) else {
        eprintln!("Skipping hidden mountpoint test - /proc not available");
        return;
    };
    if root_meta.dev() == proc_meta.dev() {
        eprintln!("Skipping hidden mountpoint test - /proc on the root device");
        return;
    }
    // Resolving every top-level entry must not meet the reserved root id.
    let reserved = std::fs::read_dir(root).unwrap().flatten().any(|e| {
        e.metadata()
            .is_ok_and(|m| m.dev() == root_meta.dev() && m.ino() == ROOT_HANDLE)
    });
    if reserved {
        eprintln!("Skipping hidden mountpoint test - reserved inode under /");
        return;
    }

    let fs = MirrorFs::new(root, MirrorOptions::default()).unwrap();
    let dir = fs.opendir(ROOT_HANDLE).unwrap();

    let mut plain = DirBuffer::new(usize::MAX);
    fs.readdir(ROOT_HANDLE, dir.fh, 0, &mut plain).unwrap();
    let mut plus = DirBuffer::new(usize::MAX);
    fs.readdirplus(ROOT_HANDLE, dir.fh, 0, &mut plus).unwrap();
    fs.releasedir(dir.fh);

    assert!(names(plain.entries()).contains(&"proc".to_string()));
    assert!(!names(plus.entries()).contains(&"proc".to_string()));
}
