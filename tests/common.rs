use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mirrorfs::mirror::{BufferedEntry, DirBuffer};
use mirrorfs::{MirrorFs, MirrorOptions, ROOT_HANDLE};
use tempfile::TempDir;

/// Get the path to the mirrorfs binary for testing.
#[allow(dead_code)]
pub fn get_mirrorfs_path() -> PathBuf {
    assert_cmd::cargo::cargo_bin!("mirrorfs").to_path_buf()
}

/// A temporary source tree together with a mirror over it.
/// #[allow(dead_code)] because not every test file uses every helper.
#[allow(dead_code)]
pub struct TestMirror {
    pub temp_dir: TempDir,
    pub fs: MirrorFs,
}

#[allow(dead_code)]
impl TestMirror {
    pub fn new() -> Self {
        Self::with_timeout(Duration::ZERO)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let fs = MirrorFs::new(temp_dir.path(), MirrorOptions { timeout }).unwrap();
        Self { temp_dir, fs }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    pub fn mkdir(&self, name: &str) -> PathBuf {
        let path = self.path().join(name);
        fs::create_dir_all(&path).unwrap();
        path
    }

    /// Look `name` up directly under the root and return its handle.
    pub fn lookup(&self, name: &str) -> u64 {
        self.fs.lookup(ROOT_HANDLE, OsStr::new(name)).unwrap().handle
    }

    /// Enumerate a directory in chunks of `capacity` bytes, resuming each
    /// call at the offset of the last entry returned.
    pub fn readdir_chunked(&self, handle: u64, capacity: usize) -> Vec<BufferedEntry> {
        let dir = self.fs.opendir(handle).unwrap();
        let mut offset = 0;
        let mut all = Vec::new();
        loop {
            let mut buf = DirBuffer::new(capacity);
            let count = self.fs.readdir(handle, dir.fh, offset, &mut buf).unwrap();
            let entries = buf.into_entries();
            assert_eq!(count, entries.len());
            match entries.last() {
                Some(last) => offset = last.offset,
                None => break,
            }
            all.extend(entries);
        }
        self.fs.releasedir(dir.fh);
        all
    }
}

impl Default for TestMirror {
    fn default() -> Self {
        Self::new()
    }
}

/// Sorted names of a set of buffered entries.
#[allow(dead_code)]
pub fn names(entries: &[BufferedEntry]) -> Vec<String> {
    let mut names: Vec<String> = entries
        .iter()
        .map(|e| e.name.to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
