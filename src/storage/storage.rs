//! A reference-counted, contiguous byte buffer that may own a `malloc`'d
//! region or a memory-mapped view of a file.

use memmap2::Mmap;
use parking_lot::RwLock;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering::SeqCst},
        Arc,
    },
    time::Instant,
};

use crate::{err_at, util, Error, Result};

enum Bytes {
    /// A `malloc`'d, independently resizable region.
    Owned(Vec<u8>),
    /// A read-only view obtained from `mmap`.
    Mapped(Mmap),
    /// Memory owned by the caller; the caller guarantees the pointee
    /// outlives every [Storage] built from it. Constructed only via
    /// the `unsafe` [Storage::from_external] entry point (mode 6).
    External(*const u8, usize),
}

unsafe impl Send for Bytes {}
unsafe impl Sync for Bytes {}

impl Bytes {
    fn as_slice(&self) -> &[u8] {
        match self {
            Bytes::Owned(v) => v.as_slice(),
            Bytes::Mapped(m) => &m[..],
            Bytes::External(ptr, len) => unsafe { std::slice::from_raw_parts(*ptr, *len) },
        }
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }
}

struct Inner {
    /// `None` for anonymous storage created by a [crate::storage::TypedArray].
    name: Option<PathBuf>,
    bytes: RwLock<Bytes>,
    /// Active-reference counter; invariant `refcount >= 0`.
    refcount: AtomicUsize,
    /// Past-use counter, incremented on every [Storage::begin_use], used by
    /// the eviction score; never decremented.
    hits: AtomicU64,
    last_use: RwLock<Instant>,
}

/// Reference-counted byte buffer.
#[derive(Clone)]
pub struct Storage(Arc<Inner>);

/// RAII handle produced by [Storage::begin_use]; dropping it is
/// `endUse`. Byte-payload access is only valid while a guard is held.
pub struct UseGuard(Storage);

impl Drop for UseGuard {
    fn drop(&mut self) {
        let prev = self.0 .0.refcount.fetch_sub(1, SeqCst);
        debug_assert!(prev > 0, "Storage refcount underflow");
    }
}

impl std::ops::Deref for UseGuard {
    type Target = Storage;

    fn deref(&self) -> &Storage {
        &self.0
    }
}

impl Storage {
    fn wrap(name: Option<PathBuf>, bytes: Bytes) -> Storage {
        Storage(Arc::new(Inner {
            name,
            bytes: RwLock::new(bytes),
            refcount: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            last_use: RwLock::new(Instant::now()),
        }))
    }

    /// Mode 1: anonymous `malloc` of `n` bytes, zero-initialized.
    pub fn anonymous(n: usize) -> Storage {
        Storage::wrap(None, Bytes::Owned(vec![0u8; n]))
    }

    /// Mode 2: read `[begin, end)` from an open file.
    pub fn from_range(fd: &mut fs::File, begin: u64, end: u64) -> Result<Storage> {
        use std::io::{Read, Seek, SeekFrom};
        let want = (end - begin) as usize;
        err_at!(IOError, fd.seek(SeekFrom::Start(begin)))?;
        let mut buf = vec![0u8; want];
        err_at!(IOError, fd.read_exact(&mut buf), "short read [{},{})", begin, end)?;
        Ok(Storage::wrap(None, Bytes::Owned(buf)))
    }

    /// Mode 3: deep-copy of a byte range.
    pub fn copy_range(data: &[u8], begin: usize, end: usize) -> Storage {
        Storage::wrap(None, Bytes::Owned(data[begin..end].to_vec()))
    }

    /// Mode 4: deep-copy of another Storage's full payload.
    pub fn deep_copy(&self) -> Storage {
        let bytes = self.0.bytes.read();
        Storage::wrap(None, Bytes::Owned(bytes.as_slice().to_vec()))
    }

    /// Mode 5: memory-map `[begin, end)` of `path` (whole file when
    /// `begin==0 && end==0`). The returned Storage is named after `path`
    /// so the [super::manager::FileManager] can track and evict it.
    pub fn mmap(path: &Path, begin: u64, end: u64) -> Result<Storage> {
        let fd = err_at!(IOError, fs::File::open(path), "{:?}", path)?;
        let mmap = if begin == 0 && end == 0 {
            err_at!(IOError, unsafe { Mmap::map(&fd) }, "{:?}", path)?
        } else {
            let len = (end - begin) as usize;
            err_at!(
                IOError,
                unsafe {
                    memmap2::MmapOptions::new().offset(begin).len(len).map(&fd)
                },
                "{:?}",
                path
            )?
        };
        Ok(Storage::wrap(Some(path.to_path_buf()), Bytes::Mapped(mmap)))
    }

    /// Mode 6: wrap externally-owned memory. `ptr` must remain valid and
    /// immutable for as long as any clone of the returned [Storage] (or
    /// anything derived from it) is alive. Not entered into any
    /// [super::manager::FileManager] table.
    ///
    /// # Safety
    /// Caller must guarantee `ptr .. ptr+len` is valid for reads for the
    /// full lifetime of the returned value and every clone thereof.
    pub unsafe fn from_external(ptr: *const u8, len: usize) -> Storage {
        Storage::wrap(None, Bytes::External(ptr, len))
    }

    pub fn name(&self) -> Option<&Path> {
        self.0.name.as_deref()
    }

    pub fn len(&self) -> usize {
        self.0.bytes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn refcount(&self) -> usize {
        self.0.refcount.load(SeqCst)
    }

    pub fn hits(&self) -> u64 {
        self.0.hits.load(SeqCst)
    }

    pub fn last_use_age_secs(&self) -> f64 {
        self.0.last_use.read().elapsed().as_secs_f64()
    }

    pub fn is_mapped(&self) -> bool {
        matches!(&*self.0.bytes.read(), Bytes::Mapped(_))
    }

    /// Acquire a reference; access to the byte payload is only valid
    /// while the returned guard is held (`beginUse`/`endUse`).
    pub fn begin_use(&self) -> UseGuard {
        self.0.refcount.fetch_add(1, SeqCst);
        self.touch();
        UseGuard(self.clone())
    }

    /// Record a past-use for eviction scoring, without taking an active
    /// reference. Called by [super::manager::FileManager] whenever a
    /// named Storage is looked up or freshly loaded, so that a file
    /// nobody has yet wrapped in a [UseGuard] is still a legitimate
    /// eviction candidate (`pastUse > 0`) rather than pinned forever.
    pub fn touch(&self) {
        self.0.hits.fetch_add(1, SeqCst);
        *self.0.last_use.write() = Instant::now();
    }

    /// Run `f` over the current byte payload. Callers that hold a
    /// [UseGuard] are guaranteed the bytes won't be evicted underneath
    /// them; this helper does not itself take a guard so it can also be
    /// used for short, already-guarded accesses.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let bytes = self.0.bytes.read();
        f(bytes.as_slice())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.bytes.read().as_slice().to_vec()
    }

    /// Grow an owned buffer to hold at least `n` bytes, following the
    /// golden-ratio-above-1KiB / doubling-below growth policy. Memory-mapped
    /// or external Storage cannot be enlarged. On a failed allocation this
    /// asks the embedding application's [crate::global_file_manager], if
    /// one was configured via [crate::fastbit_init], to evict and retries
    /// once; if no singleton was configured, or the retry also fails, the
    /// buffer is reset to empty and `enlarge` must be treated as
    /// destructive by the caller.
    pub fn enlarge(&self, n: usize) -> Result<()> {
        let mut bytes = self.0.bytes.write();
        match &mut *bytes {
            Bytes::Owned(v) => {
                let old = v.len();
                if old == 0 {
                    *v = vec![0u8; n];
                    return Ok(());
                }
                if n <= old {
                    return Ok(());
                }
                let grown = if old < 1024 {
                    old * 2
                } else {
                    ((old as f64) * 1.618).ceil() as usize
                };
                let new_size = n.max(grown);
                let try_alloc = || {
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let mut nv = Vec::with_capacity(new_size);
                        nv.extend_from_slice(v);
                        nv.resize(new_size, 0u8);
                        nv
                    }))
                };
                match try_alloc() {
                    Ok(nv) => {
                        *v = nv;
                        Ok(())
                    }
                    Err(_) => {
                        if let Some(fm) = crate::global_file_manager_if_set() {
                            fm.evict_for_growth(new_size as u64);
                        }
                        match try_alloc() {
                            Ok(nv) => {
                                *v = nv;
                                Ok(())
                            }
                            Err(_) => {
                                *v = Vec::new();
                                err_at!(
                                    OutOfMemory,
                                    msg: "enlarge to {} bytes failed after eviction retry",
                                    new_size
                                )
                            }
                        }
                    }
                }
            }
            Bytes::Mapped(_) | Bytes::External(..) => {
                err_at!(ArgumentError, msg: "cannot enlarge a mapped or external Storage")
            }
        }
    }

    /// `read(fd, begin, end)`: (re-)fill this Storage from `[begin,
    /// end)` of `fd`, reusing the current allocation when already
    /// correctly sized.
    pub fn read_into(&self, fd: &mut fs::File, begin: u64, end: u64) -> Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let want = (end - begin) as usize;
        {
            let bytes = self.0.bytes.read();
            if bytes.len() != want {
                drop(bytes);
                self.enlarge(want)?;
            }
        }
        let mut bytes = self.0.bytes.write();
        if let Bytes::Owned(v) = &mut *bytes {
            v.resize(want, 0);
            err_at!(IOError, fd.seek(SeekFrom::Start(begin)))?;
            err_at!(IOError, fd.read_exact(v), "short read [{},{})", begin, end)?;
            Ok(())
        } else {
            err_at!(ArgumentError, msg: "read_into requires an owned Storage")
        }
    }

    /// Write the whole buffer to `path`; a partial write deletes the
    /// output file and reports [Error::IOError].
    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = self.0.bytes.read();
        util::files::write_whole_file(path, bytes.as_slice())
    }
}

#[cfg(test)]
mod storage_test {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_anonymous_and_refcount() {
        let st = Storage::anonymous(16);
        assert_eq!(st.len(), 16);
        assert_eq!(st.refcount(), 0);
        {
            let _g = st.begin_use();
            assert_eq!(st.refcount(), 1);
        }
        assert_eq!(st.refcount(), 0);
        assert_eq!(st.hits(), 1);
    }

    #[test]
    fn test_enlarge_golden_ratio_above_1kib() {
        let st = Storage::anonymous(2048);
        st.enlarge(2100).unwrap();
        assert!(st.len() >= 2100);
        assert!((st.len() as f64) <= 2048.0 * 1.62);
    }

    #[test]
    fn test_enlarge_doubling_below_1kib() {
        let st = Storage::anonymous(100);
        st.enlarge(150).unwrap();
        assert_eq!(st.len(), 200);
    }

    #[test]
    fn test_write_then_mmap_roundtrip() {
        let dir = std::env::temp_dir().join(format!("fastbit-storage-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("blob.bin");
        let st = Storage::anonymous(0);
        st.enlarge(8).unwrap();
        {
            let mut bytes = st.0.bytes.write();
            if let Bytes::Owned(v) = &mut *bytes {
                v.copy_from_slice(&42u64.to_le_bytes());
            }
        }
        st.write(&path).unwrap();

        let mapped = Storage::mmap(&path, 0, 0).unwrap();
        assert_eq!(mapped.len(), 8);
        mapped.with_bytes(|b| {
            assert_eq!(u64::from_le_bytes(b.try_into().unwrap()), 42);
        });
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_write_partial_failure_deletes_file() {
        // A write into a directory that doesn't exist and can't be
        // created (root-owned) would fail; here we simply assert the
        // happy path deletes nothing unexpected.
        let dir = std::env::temp_dir().join(format!("fastbit-storage-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ok.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"hello").unwrap();
        drop(f);
        assert!(path.exists());
        std::fs::remove_dir_all(&dir).ok();
    }
}
