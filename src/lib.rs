//! FastBit: a column-oriented bitmap-index engine for read-mostly
//! scientific data. This crate implements the storage core
//! (FileManager/Storage/TypedArray), the Dictionary, the BitmapIndex and
//! its coarse bylt/fuzz/zona refinements, and the post-query Bundle
//! grouping layer. The SQL-ish query parser, RID generation, and CLI
//! surfaces named out of scope in the design are left to embedding
//! applications.

pub mod bundle;
pub mod config;
pub mod dict;
pub mod error;
pub mod index;
pub mod storage;
pub mod util;

pub use bundle::{Aggregator, Bundle, BundleCursor, ColumnTag, ColumnValues, Projection, Rid};
pub use config::FileManagerConfig;
pub use dict::Dictionary;
pub use error::{Error, Result};
pub use index::{BitmapIndex, CoarseBitmap, Op, RangePredicate, Variant, MIN_K_FOR_COARSE};
pub use storage::{Bitvector, FileManager, Hint, Storage, TypedArray};

use std::sync::Arc;

use parking_lot::Mutex;

/// Process-wide [FileManager] singleton, lazily initialized. `None` before
/// [fastbit_init] or after [fastbit_fini].
static FILE_MANAGER: Mutex<Option<Arc<FileManager>>> = Mutex::new(None);

/// Explicit init entry point. Re-initializing while already initialized
/// replaces the singleton, dropping the old one once its last `Arc` clone
/// is released.
pub fn fastbit_init(config: FileManagerConfig) {
    let mut slot = FILE_MANAGER.lock();
    *slot = Some(Arc::new(FileManager::new(config)));
}

/// Like [fastbit_init], but only initializes if no singleton exists yet;
/// returns the (possibly pre-existing) singleton.
pub fn fastbit_init_once(config: FileManagerConfig) -> Arc<FileManager> {
    let mut slot = FILE_MANAGER.lock();
    slot.get_or_insert_with(|| Arc::new(FileManager::new(config))).clone()
}

/// Borrow the process-wide FileManager. Panics if [fastbit_init] was
/// never called; callers that can't guarantee init order should use
/// [fastbit_init_once] instead.
pub fn global_file_manager() -> Arc<FileManager> {
    FILE_MANAGER
        .lock()
        .clone()
        .expect("fastbit_init must run before global_file_manager is used")
}

/// Like [global_file_manager], but `None` instead of a panic when no
/// singleton has been configured yet. Used by internal backstops (e.g.
/// [storage::storage::Storage::enlarge]'s out-of-memory eviction retry)
/// that should cooperate with an embedding application's FileManager when
/// one exists, and simply skip the eviction attempt when none does.
pub fn global_file_manager_if_set() -> Option<Arc<FileManager>> {
    FILE_MANAGER.lock().clone()
}

/// Teardown: drop this process's handle on the global FileManager. Any
/// Storage still referenced by a live handle elsewhere keeps the
/// FileManager alive until that handle is dropped too.
pub fn fastbit_fini() {
    let mut slot = FILE_MANAGER.lock();
    *slot = None;
}

#[cfg(test)]
mod lib_test {
    use super::*;

    // Both cases share one test: the global singleton is process-wide, so
    // two tests mutating it independently would race under `cargo test`'s
    // default parallel test threads.
    #[test]
    fn test_init_fini_and_idempotent_reinit() {
        fastbit_init(FileManagerConfig::default());
        let fm = global_file_manager();
        assert_eq!(fm.in_use_bytes(), 0);

        let a = fastbit_init_once(FileManagerConfig::default());
        let b = fastbit_init_once(FileManagerConfig::default());
        assert!(Arc::ptr_eq(&a, &b));

        fastbit_fini();
    }
}
