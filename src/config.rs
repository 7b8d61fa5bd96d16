//! Flat `name=value` configuration surface recognized by the storage and
//! index layers. Loading a full configuration file is a concern of
//! the embedding application (the `resource` class of the originating
//! tree is explicitly out of scope); this module only defines the
//! handful of options the core itself consults, with sane defaults when
//! a key is absent.

use serde::Deserialize;

/// `fileManager.*` options.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FileManagerConfig {
    /// Total byte budget across mapped + in-memory Storage. Defaults to
    /// roughly half of physical memory, falling back to 200 MiB when
    /// that cannot be determined.
    pub max_bytes: u64,
    /// Cap on the number of memory-mapped files. Defaults to 0.75x the
    /// process open-file limit.
    pub max_open_files: usize,
    /// Minimum request size eligible for mmap under the `MmapLarge` hint.
    pub min_map_size: u64,
    /// Seconds an eviction waiter blocks before giving up with
    /// `OutOfBudget`; a quarter of this is the actual timed wait.
    pub unload_timeout_secs: u64,
}

pub const DEFAULT_MAX_BYTES_FALLBACK: u64 = 200 * 1024 * 1024;
pub const DEFAULT_UNLOAD_TIMEOUT_SECS: u64 = 60;

impl Default for FileManagerConfig {
    fn default() -> Self {
        FileManagerConfig {
            max_bytes: default_max_bytes(),
            max_open_files: default_max_open_files(),
            min_map_size: 1024 * 1024,
            unload_timeout_secs: DEFAULT_UNLOAD_TIMEOUT_SECS,
        }
    }
}

fn default_max_bytes() -> u64 {
    match sys_memory_bytes() {
        Some(mem) if mem > 0 => mem / 2,
        _ => DEFAULT_MAX_BYTES_FALLBACK,
    }
}

fn default_max_open_files() -> usize {
    // 0.75 * (64 fds per core), a conservative rlimit-agnostic default;
    // embedding apps that know their actual rlimit should override via
    // set_max_open_files.
    let base = 64usize.saturating_mul(num_cpus::get().max(1));
    (base * 3) / 4
}

#[cfg(target_os = "linux")]
fn sys_memory_bytes() -> Option<u64> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn sys_memory_bytes() -> Option<u64> {
    None
}

impl FileManagerConfig {
    pub fn set_max_bytes(&mut self, n: u64) -> &mut Self {
        self.max_bytes = n;
        self
    }

    pub fn set_max_open_files(&mut self, n: usize) -> &mut Self {
        self.max_open_files = n;
        self
    }

    pub fn set_min_map_size(&mut self, n: u64) -> &mut Self {
        self.min_map_size = n;
        self
    }
}

/// `<column>.indexSpec ncoarse=k` — coarse-bin count override for the
/// CoarseBitmap variants. `None` selects the per-variant default.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct IndexSpec {
    pub ncoarse: Option<usize>,
}

/// Parse a TOML document of recognized flat keys, e.g.:
///
/// ```toml
/// [file_manager]
/// max_bytes = 209715200
/// max_open_files = 128
/// ```
pub fn parse_toml(doc: &str) -> crate::Result<FileManagerConfig> {
    #[derive(Deserialize)]
    #[serde(default)]
    struct Doc {
        file_manager: FileManagerConfig,
    }
    impl Default for Doc {
        fn default() -> Self {
            Doc { file_manager: FileManagerConfig::default() }
        }
    }

    let doc: Doc = crate::err_at!(BadFormat, toml::from_str(doc))?;
    Ok(doc.file_manager)
}

#[cfg(test)]
mod config_test {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = FileManagerConfig::default();
        assert!(cfg.max_bytes > 0);
        assert!(cfg.unload_timeout_secs == 60);
    }

    #[test]
    fn test_parse_toml() {
        let doc = "[file_manager]\nmax_bytes = 1048576\nmax_open_files = 16\n";
        let cfg = parse_toml(doc).unwrap();
        assert_eq!(cfg.max_bytes, 1_048_576);
        assert_eq!(cfg.max_open_files, 16);
    }
}
