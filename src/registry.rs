//! Process-wide cache registry.
//!
//! Cross-cache dependency edges and the eviction scheduler address caches
//! by id; the registry resolves those ids. Entries are appended once per
//! cache and weakly held, so dropping a cache turns its edges into no-ops
//! instead of keeping it alive forever.

use std::sync::{Arc, RwLock, Weak};

use once_cell::sync::Lazy;

use crate::cache::Cache;
use crate::lock::{rw_read, rw_write};

const SOURCE: &str = "registry";

static CACHES: Lazy<RwLock<Vec<Weak<Cache>>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Register a cache under the next free id. The id is handed to the
/// constructor so the cache can carry it from birth.
pub(crate) fn register(build: impl FnOnce(usize) -> Cache) -> Arc<Cache> {
    let mut caches = rw_write(&CACHES, SOURCE, "register");
    let cache = Arc::new(build(caches.len()));
    caches.push(Arc::downgrade(&cache));
    cache
}

/// Resolve a cache by id. `None` when the cache has been dropped.
pub(crate) fn get(id: usize) -> Option<Arc<Cache>> {
    rw_read(&CACHES, SOURCE, "get").get(id)?.upgrade()
}
