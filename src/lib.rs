//! Soffietto — recursive, compression-aware record cache.
//!
//! Clients request records by key from a [`Frontend`]; on a miss the
//! calling task runs the frontend's generator, which writes raw bytes
//! through a [`RecordWriter`] and may *include* records from this or other
//! caches. Output is stored as independently deflate-compressed frames
//! with their Adler-32 checksums and uncompressed lengths, so the frames
//! of a record — and of all its transitive inclusions — concatenate into
//! one valid deflate/zlib stream. A complete HTTP response can then be
//! streamed without recompression or copying, while every sub-record stays
//! individually cached, shared and evictable.
//!
//! At most one generator runs per key at a time: concurrent requesters
//! block on the record's readiness gate and share the outcome, including a
//! generation error.
//!
//! ## Eviction
//!
//! Each [`Cache`] carries a memory limit and an LRU age limit
//! ([`CacheOptions`]); enforcement is eventual, trimming up to two least
//! recently used records per lookup. Included records form a dependency
//! graph: evicting a record cascades to every record that included it,
//! across caches. Scheduled evictions are debounced to the earliest
//! requested deadline per record.
//!
//! ```no_run
//! use std::io::Write;
//!
//! use soffietto::{Cache, CacheOptions, RecordWriter};
//!
//! let cache = Cache::new(CacheOptions::default());
//! let pages = cache.new_frontend(|key: &String, writer: &mut RecordWriter| {
//!     write!(writer, "<h1>{key}</h1>")?;
//!     Ok(())
//! });
//!
//! let record = pages.get("hello".to_owned())?;
//! println!("etag: {}", record.etag());
//! # Ok::<(), soffietto::Error>(())
//! ```

mod cache;
mod component;
mod config;
mod error;
mod frame;
mod frontend;
mod http;
mod key;
mod lock;
mod lru;
mod record;
mod registry;
mod scheduler;
mod writer;

#[cfg(test)]
mod tests;

pub use cache::Cache;
pub use config::{CacheOptions, CompressionLevel, FrontendOptions};
pub use error::Error;
pub use frontend::{Frontend, Generator};
pub use key::Key;
pub use record::{Record, RecordReader};
pub use writer::RecordWriter;
