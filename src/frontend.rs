//! Frontends: a keyspace plus generator on top of a cache.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::cache::Cache;
use crate::component::ComponentList;
use crate::config::{CompressionLevel, FrontendOptions};
use crate::error::Error;
use crate::frame::FrameDescriptor;
use crate::key::{GlobalLocation, Key, KeyHandle, Location};
use crate::record::{Record, RecordBody, RecordCell};
use crate::writer::RecordWriter;

/// Generates fresh records for the keys of one frontend by writing to the
/// provided [`RecordWriter`]. Runs on the first requester's thread and must
/// be thread-safe; the produced record is immutable once the call returns.
pub type Generator<K> = dyn Fn(&K, &mut RecordWriter) -> Result<(), Error> + Send + Sync;

/// Typed access to one keyspace of a cache.
///
/// Cloning is cheap; clones address the same keyspace.
pub struct Frontend<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for Frontend<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K> {
    id: usize,
    cache: Arc<Cache>,
    generator: Box<Generator<K>>,
    level: CompressionLevel,
}

impl<K: Key> Frontend<K> {
    pub(crate) fn new(
        id: usize,
        cache: Arc<Cache>,
        options: FrontendOptions,
        generator: Box<Generator<K>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                cache,
                generator,
                level: options.level,
            }),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.inner.id
    }

    pub(crate) fn cache_id(&self) -> usize {
        self.inner.cache.id()
    }

    /// Compression level applied to this frontend's records.
    pub fn level(&self) -> CompressionLevel {
        self.inner.level
    }

    /// Get the record under `key`, generating it if absent.
    ///
    /// Exactly one caller runs the generator per population; everyone else
    /// blocks on the record's readiness gate and shares the outcome,
    /// including a population error.
    pub fn get(&self, key: K) -> Result<Record, Error> {
        self.get_by_handle(KeyHandle::new(key))
    }

    pub(crate) fn get_by_handle(&self, key: KeyHandle) -> Result<Record, Error> {
        let loc = Location {
            frontend: self.inner.id,
            key,
        };
        let (cell, fresh) = self.inner.cache.get_or_create(&loc);
        if fresh {
            match self.populate(&loc, &cell) {
                Ok(record) => cell.publish(Ok(record)),
                Err(err) => {
                    debug!(
                        cache = self.cache_id(),
                        frontend = self.inner.id,
                        key = ?loc.key,
                        error = %err,
                        "record population failed"
                    );
                    // Drop the slot before waiters wake, so the failed
                    // record can no longer be looked up by key.
                    self.inner.cache.evict(&loc, Duration::ZERO);
                    cell.publish(Err(err));
                }
            }
        }
        cell.resolve()
    }

    /// Run the generator and assemble the record.
    fn populate(&self, loc: &Location, cell: &Arc<RecordCell>) -> Result<Record, Error> {
        let Some(key) = loc.key.downcast_ref::<K>() else {
            unreachable!("frontend bucket holds a foreign key type");
        };

        let mut writer = RecordWriter::new(
            GlobalLocation {
                cache: self.cache_id(),
                frontend: self.inner.id,
                key: loc.key.clone(),
            },
            self.inner.level,
        );
        (self.inner.generator)(key, &mut writer)?;
        let components = writer.finish()?;

        let (descriptor, hash, memory_used) = aggregate(&components);
        let mut etag = String::with_capacity(29);
        etag.push('"');
        STANDARD_NO_PAD.encode_string(hash, &mut etag);
        etag.push('"');

        let record = Record::new(RecordBody {
            components,
            descriptor,
            hash,
            etag,
        });
        self.inner.cache.set_used_memory(cell, loc, memory_used);
        Ok(record)
    }

    /// Evict the record under `key` after `delay`; `Duration::ZERO` evicts
    /// immediately.
    ///
    /// Scheduled evictions debounce per record: a later request with a
    /// longer delay than what is already pending has no effect, a shorter
    /// one replaces the pending deadline.
    pub fn evict(&self, delay: Duration, key: K) {
        self.inner.cache.evict(
            &Location {
                frontend: self.inner.id,
                key: KeyHandle::new(key),
            },
            delay,
        );
    }

    /// Evict every record of this frontend after `delay`.
    pub fn evict_all(&self, delay: Duration) {
        self.inner.cache.evict_frontend(self.inner.id, delay);
    }

    /// Evict the records whose key matches, after `delay`. A matcher error
    /// aborts the sweep and is returned; records matched before the error
    /// are still evicted.
    pub fn evict_by_func(
        &self,
        delay: Duration,
        matcher: impl Fn(&K) -> Result<bool, Error>,
    ) -> Result<(), Error> {
        self.inner
            .cache
            .evict_by_func(self.inner.id, delay, &|key: &KeyHandle| {
                match key.downcast_ref::<K>() {
                    Some(key) => matcher(key),
                    None => Ok(false),
                }
            })
    }
}

/// Fold the aggregate descriptor, content hash and charged memory of a
/// component list.
fn aggregate(components: &ComponentList) -> (FrameDescriptor, [u8; 20], usize) {
    // Single-component records are the common case and copy straight
    // through.
    if let [only] = components.as_slice() {
        return (only.descriptor(), only.hash(), only.size());
    }

    let mut descriptor = FrameDescriptor::default();
    let mut digest = Sha1::new();
    let mut memory_used = 0;
    for (index, component) in components.iter().enumerate() {
        if index == 0 {
            descriptor = component.descriptor();
        } else {
            descriptor.combine(component.descriptor());
        }
        // Hashing the component hashes propagates changes from deep in the
        // reference tree.
        digest.update(component.hash());
        memory_used += component.size();
    }
    (descriptor, digest.finalize().into(), memory_used)
}
