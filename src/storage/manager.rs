//! Process-wide registry of [Storage] buffers backed by files or
//! anonymous memory.

use parking_lot::{Condvar, Mutex, RwLock};

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering::SeqCst},
    time::Duration,
};

use crate::{config::FileManagerConfig, err_at, storage::storage::Storage, Error, Result};

/// Hint passed to [FileManager::get_file] steering the map-vs-read policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hint {
    /// Prefer mmap only when the request is large and an mmap slot is free.
    MmapLarge,
    /// Always prefer reading into memory.
    PreferRead,
    /// Always prefer mmap when an mmap slot is free.
    PreferMmap,
}

type Cleaner = Box<dyn Fn() + Send + Sync>;

struct Tables {
    mapped: HashMap<PathBuf, Storage>,
    memory: HashMap<PathBuf, Storage>,
}

impl Tables {
    fn get(&self, name: &Path) -> Option<Storage> {
        self.mapped.get(name).or_else(|| self.memory.get(name)).cloned()
    }

    fn contains(&self, name: &Path) -> bool {
        self.mapped.contains_key(name) || self.memory.contains_key(name)
    }
}

/// Candidate considered during eviction.
struct Candidate {
    name: PathBuf,
    mapped: bool,
    size: u64,
    score: f64,
}

pub struct FileManager {
    config: FileManagerConfig,
    tables: RwLock<Tables>,
    in_use_bytes: AtomicU64,
    pending: Mutex<HashSet<PathBuf>>,
    pending_cv: Condvar,
    evict_waiting: Mutex<bool>,
    evict_cv: Condvar,
    cleaners: Mutex<Vec<(u64, Cleaner)>>,
    next_cleaner_id: AtomicU64,
}

impl FileManager {
    pub fn new(config: FileManagerConfig) -> FileManager {
        FileManager {
            config,
            tables: RwLock::new(Tables { mapped: HashMap::new(), memory: HashMap::new() }),
            in_use_bytes: AtomicU64::new(0),
            pending: Mutex::new(HashSet::new()),
            pending_cv: Condvar::new(),
            evict_waiting: Mutex::new(false),
            evict_cv: Condvar::new(),
            cleaners: Mutex::new(Vec::new()),
            next_cleaner_id: AtomicU64::new(0),
        }
    }

    pub fn in_use_bytes(&self) -> u64 {
        self.in_use_bytes.load(SeqCst)
    }

    pub fn max_bytes(&self) -> u64 {
        self.config.max_bytes
    }

    pub fn mapped_count(&self) -> usize {
        self.tables.read().mapped.len()
    }

    /// Register an external-process callback invoked while holding the
    /// eviction path, to let higher layers drop their own caches.
    /// Returns an id usable with [FileManager::remove_cleaner].
    pub fn add_cleaner(&self, cb: Cleaner) -> u64 {
        let id = self.next_cleaner_id.fetch_add(1, SeqCst);
        self.cleaners.lock().push((id, cb));
        id
    }

    pub fn remove_cleaner(&self, id: u64) {
        self.cleaners.lock().retain(|(cid, _)| *cid != id);
    }

    fn invoke_cleaners(&self) {
        // Cleaners must not call back into get_file for the same name:
        // we only hold our own internal locks here, not the tables lock,
        // so a reentrant get_file for a *different* name is safe but a
        // cleaner touching this manager's own tables recursively would
        // deadlock on `tables` - documented caller responsibility.
        let cleaners = self.cleaners.lock();
        for (_, cb) in cleaners.iter() {
            cb();
        }
    }

    /// Wake any thread blocked in [FileManager::ensure_budget] waiting
    /// for memory to become available.
    pub fn signal_memory_available(&self) {
        self.evict_cv.notify_all();
    }

    /// Best-effort eviction for a caller that is about to retry its own
    /// allocation, such as [super::storage::Storage::enlarge] on
    /// out-of-memory. Runs the same cleaner-then-evict pass as
    /// [FileManager::ensure_budget] but never blocks and never errors:
    /// the caller's retry is what actually succeeds or fails.
    pub fn evict_for_growth(&self, need: u64) -> bool {
        if self.try_evict(need) {
            return true;
        }
        self.invoke_cleaners();
        self.try_evict(need)
    }

    /// `getFile(name, hint)`: return a shared [Storage] for `name`,
    /// loading it (mmap or read) on first access. The returned handle is
    /// not itself an active reference; callers that want to pin the
    /// Storage against eviction while they dereference its bytes should
    /// wrap that span in [Storage::begin_use].
    pub fn get_file(&self, name: &Path, hint: Hint) -> Result<Storage> {
        self.get_file_inner(name, hint, true)
    }

    /// `tryGetFile(name, hint)`: like [FileManager::get_file] but never
    /// waits; returns [Error::WouldBlock] instead.
    pub fn try_get_file(&self, name: &Path, hint: Hint) -> Result<Storage> {
        self.get_file_inner(name, hint, false)
    }

    fn get_file_inner(&self, name: &Path, hint: Hint, may_wait: bool) -> Result<Storage> {
        loop {
            if let Some(st) = self.tables.read().get(name) {
                st.touch();
                return Ok(st);
            }

            {
                let mut pending = self.pending.lock();
                if pending.contains(name) {
                    if !may_wait {
                        return err_at!(WouldBlock, msg: "{:?} is being loaded", name);
                    }
                    self.pending_cv.wait(&mut pending);
                    continue;
                }
                pending.insert(name.to_path_buf());
            }

            let result = self.load_and_insert(name, hint, may_wait);

            self.pending.lock().remove(name);
            self.pending_cv.notify_all();

            return result;
        }
    }

    fn load_and_insert(&self, name: &Path, hint: Hint, may_wait: bool) -> Result<Storage> {
        if !name.exists() {
            return err_at!(NotFound, msg: "{:?}", name);
        }
        let size = err_at!(IOError, fs::metadata(name), "{:?}", name)?.len();

        self.ensure_budget(size, may_wait)?;

        let use_mmap = self.should_mmap(size, hint);
        let st = if use_mmap {
            Storage::mmap(name, 0, 0)?
        } else {
            let mut fd = err_at!(IOError, fs::File::open(name), "{:?}", name)?;
            Storage::from_range(&mut fd, 0, size)?
        };

        let mut tables = self.tables.write();
        if use_mmap {
            tables.mapped.insert(name.to_path_buf(), st.clone());
        } else {
            tables.memory.insert(name.to_path_buf(), st.clone());
        }
        self.in_use_bytes.fetch_add(size, SeqCst);
        drop(tables);

        st.touch();
        Ok(st)
    }

    fn should_mmap(&self, size: u64, hint: Hint) -> bool {
        if self.mapped_count() >= self.config.max_open_files {
            return false;
        }
        match hint {
            Hint::PreferMmap => true,
            Hint::PreferRead => false,
            Hint::MmapLarge => {
                let largest_mapped =
                    self.tables.read().mapped.values().map(|s| s.len() as u64).max().unwrap_or(0);
                size >= self.config.min_map_size.max(largest_mapped)
            }
        }
    }

    /// `getFileSegment(name, begin, end)`: a private, un-tracked view of
    /// exactly `end-begin` bytes.
    pub fn get_file_segment(&self, name: &Path, begin: u64, end: u64) -> Result<Storage> {
        if end < begin {
            return err_at!(ArgumentError, msg: "end {} < begin {}", end, begin);
        }
        let need = end - begin;
        self.ensure_budget(need, true)?;
        let mut fd = err_at!(IOError, fs::File::open(name), "{:?}", name)?;
        Storage::from_range(&mut fd, begin, end)
    }

    /// `flushFile(name)`: drop from the tables if unreferenced, else log
    /// and do nothing.
    pub fn flush_file(&self, name: &Path) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(st) = tables.mapped.get(name).or_else(|| tables.memory.get(name)) {
            if st.refcount() > 0 {
                log::warn!("flushFile: {:?} still in use, refcount={}", name, st.refcount());
                return Ok(());
            }
            let size = st.len() as u64;
            tables.mapped.remove(name);
            tables.memory.remove(name);
            self.in_use_bytes.fetch_sub(size, SeqCst);
        }
        Ok(())
    }

    /// `flushDir(dir)`: flush every tracked file located under `dir`.
    pub fn flush_dir(&self, dir: &Path) -> Result<()> {
        let names: Vec<PathBuf> = {
            let tables = self.tables.read();
            tables
                .mapped
                .keys()
                .chain(tables.memory.keys())
                .filter(|p| p.starts_with(dir))
                .cloned()
                .collect()
        };
        for name in names {
            self.flush_file(&name)?;
        }
        Ok(())
    }

    /// Ensure `need` additional bytes can be accommodated within the
    /// configured budget, evicting unreferenced Storage as necessary
    /// (eviction algorithm).
    fn ensure_budget(&self, need: u64, may_wait: bool) -> Result<()> {
        if self.in_use_bytes.load(SeqCst) + need <= self.config.max_bytes {
            return Ok(());
        }

        loop {
            if self.try_evict(need) {
                return Ok(());
            }
            self.invoke_cleaners();
            if self.try_evict(need) {
                return Ok(());
            }

            if !may_wait {
                return err_at!(
                    OutOfBudget,
                    msg: "need {} bytes, in_use {}, max {}",
                    need, self.in_use_bytes.load(SeqCst), self.config.max_bytes
                );
            }

            let mut waiting = self.evict_waiting.lock();
            if *waiting {
                return err_at!(OutOfBudget, msg: "another thread is already evicting");
            }
            *waiting = true;
            let timeout = Duration::from_secs_f64(self.config.unload_timeout_secs as f64 / 4.0);
            let result = self.evict_cv.wait_for(&mut waiting, timeout);
            *waiting = false;
            if result.timed_out() {
                return err_at!(OutOfBudget, msg: "timed out waiting for memory");
            }
            // loop back and retry now that some other thread may have
            // released Storage.
        }
    }

    /// Attempt one eviction pass; returns true if `need` additional
    /// bytes are now available.
    fn try_evict(&self, need: u64) -> bool {
        let now_free = self.config.max_bytes.saturating_sub(self.in_use_bytes.load(SeqCst));
        if now_free >= need {
            return true;
        }
        let mut to_free = need - now_free;

        let mut candidates: Vec<Candidate> = {
            let tables = self.tables.read();
            tables
                .mapped
                .iter()
                .filter(|(_, s)| s.refcount() == 0 && s.hits() > 0)
                .map(|(n, s)| Candidate {
                    name: n.clone(),
                    mapped: true,
                    size: s.len() as u64,
                    score: score_of(s),
                })
                .chain(tables.memory.iter().filter(|(_, s)| s.refcount() == 0 && s.hits() > 0).map(
                    |(n, s)| Candidate {
                        name: n.clone(),
                        mapped: false,
                        size: s.len() as u64,
                        score: score_of(s),
                    },
                ))
                .collect()
        };

        // highest score = most worth keeping; evict from the bottom.
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());

        let mut tables = self.tables.write();
        while to_free > 0 {
            let cand = match candidates.pop() {
                Some(c) => c,
                None => break,
            };
            let removed = if cand.mapped {
                tables.mapped.remove(&cand.name)
            } else {
                tables.memory.remove(&cand.name)
            };
            if let Some(st) = removed {
                if st.refcount() > 0 {
                    // raced with a concurrent begin_use; put it back.
                    if cand.mapped {
                        tables.mapped.insert(cand.name, st);
                    } else {
                        tables.memory.insert(cand.name, st);
                    }
                    continue;
                }
                self.in_use_bytes.fetch_sub(cand.size, SeqCst);
                to_free = to_free.saturating_sub(cand.size);
            }
        }

        to_free == 0
    }
}

fn score_of(s: &Storage) -> f64 {
    let age = s.last_use_age_secs().max(1e-6);
    let size = s.len() as f64;
    let hits = s.hits() as f64;
    ((size + age).sqrt() + hits / age) / age
}

#[cfg(test)]
mod manager_test {
    use super::*;
    use std::io::Write;

    fn tmp_file(dir: &Path, name: &str, size: usize) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(&vec![7u8; size]).unwrap();
        path
    }

    #[test]
    fn test_get_file_reads_and_caches() {
        let dir = std::env::temp_dir().join(format!("fastbit-fm-{}-a", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = tmp_file(&dir, "f1.bin", 128);

        let mut cfg = FileManagerConfig::default();
        cfg.max_bytes = 10_000_000;
        let fm = FileManager::new(cfg);

        let st1 = fm.get_file(&path, Hint::PreferRead).unwrap();
        assert_eq!(st1.len(), 128);
        let st2 = fm.get_file(&path, Hint::PreferRead).unwrap();
        assert_eq!(st2.len(), 128);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_eviction_under_budget_pressure() {
        let dir = std::env::temp_dir().join(format!("fastbit-fm-{}-b", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let unit = 1000usize;
        let p1 = tmp_file(&dir, "e1.bin", unit);
        let p2 = tmp_file(&dir, "e2.bin", unit);
        let p3 = tmp_file(&dir, "e3.bin", unit);

        let mut cfg = FileManagerConfig::default();
        cfg.max_bytes = (unit as f64 * 2.5) as u64;
        cfg.unload_timeout_secs = 1;
        let fm = FileManager::new(cfg);

        let _s1 = fm.get_file(&p1, Hint::PreferRead).unwrap();
        let _s2 = fm.get_file(&p2, Hint::PreferRead).unwrap();
        let _s3 = fm.get_file(&p3, Hint::PreferRead).unwrap();

        assert!(fm.in_use_bytes() <= fm.max_bytes() + unit as u64);

        fs::remove_dir_all(&dir).ok();
    }
}
