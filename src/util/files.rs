//! Path and file helpers shared by the storage, index, dictionary and
//! bundle writers.

use fs2::FileExt;

use std::{
    fs,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use crate::{err_at, Error, Result};

/// Create (or truncate) a file for writing, creating parent directories
/// as needed.
pub fn create_file(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        err_at!(IOError, fs::create_dir_all(parent), "{:?}", parent)?;
    }
    err_at!(
        IOError,
        fs::OpenOptions::new().write(true).create(true).truncate(true).open(path),
        "{:?}",
        path
    )
}

/// Open an existing file read-only.
pub fn open_file_r(path: &Path) -> Result<fs::File> {
    err_at!(IOError, fs::OpenOptions::new().read(true).open(path), "{:?}", path)
}

/// Write `data` to `path`, deleting the partial file if the write fails
/// part-way through. Takes an advisory exclusive lock for the duration of
/// the write so that a concurrent writer in another process (e.g. a
/// rebuild of the same index file racing an in-progress one) blocks
/// rather than interleaving output; readers never take this lock, since
/// [FileManager][crate::storage::FileManager] treats an in-progress
/// rename/replace as the synchronization point, not the write itself.
pub fn write_whole_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut fd = create_file(path)?;
    err_at!(IOError, fd.lock_exclusive(), "{:?}", path)?;
    let result = fd.write_all(data).and_then(|()| fd.sync_all());
    fd.unlock().ok();
    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            drop(fd);
            remove_file_if_exists(path).ok();
            err_at!(IOError, Err(err), "partial write to {:?}", path)
        }
    }
}

/// Read the byte range `[begin, end)` of `path` into a freshly allocated
/// buffer, failing with [Error::IOError] on a short read.
pub fn read_file_range(path: &Path, begin: u64, end: u64) -> Result<Vec<u8>> {
    let want = end.saturating_sub(begin) as usize;
    let mut fd = open_file_r(path)?;
    err_at!(IOError, fd.seek(SeekFrom::Start(begin)), "{:?}", path)?;
    let mut buf = vec![0u8; want];
    err_at!(IOError, fd.read_exact(&mut buf), "short read {:?} [{},{})", path, begin, end)?;
    Ok(buf)
}

/// Length, in bytes, of the file at `path`.
pub fn file_len(path: &Path) -> Result<u64> {
    Ok(err_at!(IOError, fs::metadata(path), "{:?}", path)?.len())
}

/// Drop `path` from the filesystem if it exists, tolerating a concurrent
/// deletion (`NotFound` is not an error). Used to clean up a partial
/// output file once a write fails part-way through; note this is
/// distinct from `flushFile`/`flushDir`, which only drop a Storage from
/// the [FileManager][crate::storage::FileManager]'s in-memory tables and
/// never touch the underlying file.
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => err_at!(IOError, Err(err), "{:?}", path),
    }
}
