//! Cached records and their readiness gate.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, OnceLock};

use bytes::{Buf, Bytes};
use flate2::read::DeflateDecoder;
use serde::de::DeserializeOwned;

use crate::component::{Component, ComponentList, ContentHash};
use crate::error::Error;
use crate::frame::FrameDescriptor;

/// Empty final deflate block. Appending it terminates a concatenation of
/// sync-flushed frames into a complete deflate stream.
pub(crate) const STREAM_END: [u8; 2] = [0x03, 0x00];

/// Per-location record slot.
///
/// The `OnceLock` doubles as the one-shot readiness gate: `resolve` blocks
/// until the populating task publishes, and afterwards the gate is a single
/// atomic load. Everything behind the gate is immutable, so readers need no
/// further synchronization.
pub(crate) struct RecordCell {
    slot: OnceLock<Result<Record, Error>>,
}

impl RecordCell {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: OnceLock::new(),
        })
    }

    /// Block until populated, then return the population outcome.
    pub(crate) fn resolve(&self) -> Result<Record, Error> {
        self.slot.wait().clone()
    }

    /// Publish the population outcome and open the gate. The populating
    /// task calls this exactly once; a duplicate publish is ignored.
    pub(crate) fn publish(&self, outcome: Result<Record, Error>) {
        let _ = self.slot.set(outcome);
    }

    /// Non-blocking view of the outcome, for accounting checks.
    #[cfg(test)]
    pub(crate) fn peek(&self) -> Option<&Result<Record, Error>> {
        self.slot.get()
    }
}

/// Immutable cached data unit, linked to a single key on a frontend.
///
/// Cloning is cheap (shared body). In-flight readers keep an evicted
/// record's memory alive; it is freed when the last handle drops.
#[derive(Clone)]
pub struct Record {
    body: Arc<RecordBody>,
}

pub(crate) struct RecordBody {
    pub components: ComponentList,
    pub descriptor: FrameDescriptor,
    pub hash: ContentHash,
    pub etag: String,
}

impl Record {
    pub(crate) fn new(body: RecordBody) -> Self {
        Self {
            body: Arc::new(body),
        }
    }

    pub(crate) fn descriptor(&self) -> FrameDescriptor {
        self.body.descriptor
    }

    #[cfg(test)]
    pub(crate) fn components(&self) -> &ComponentList {
        &self.body.components
    }

    /// SHA-1 of the record content.
    pub fn sha1(&self) -> [u8; 20] {
        self.body.hash
    }

    /// Strong ETag of the content as served compressed.
    pub fn etag(&self) -> &str {
        &self.body.etag
    }

    /// Strong ETag of the content as served decompressed. Distinct from
    /// [`Record::etag`] to keep strong ETags byte-exact per representation.
    pub fn etag_decompressed(&self) -> String {
        let quoted = &self.body.etag;
        format!("{}-uc\"", &quoted[..quoted.len() - 1])
    }

    /// Write the raw compressed stream to `w`: every frame in order, with
    /// references expanded to the referenced record's frames. Consumer I/O
    /// errors are returned as-is and do not affect the record.
    pub fn write_to(&self, w: &mut (impl Write + ?Sized)) -> io::Result<u64> {
        let mut written = 0u64;
        for component in &self.body.components {
            written += match component {
                Component::Frame(frame) => {
                    w.write_all(&frame.data)?;
                    frame.data.len() as u64
                }
                Component::Reference(reference) => reference.record.write_to(w)?,
            };
        }
        Ok(written)
    }

    pub(crate) fn push_chunks(&self, out: &mut Vec<Bytes>) {
        for component in &self.body.components {
            component.push_chunks(out);
        }
    }

    /// The compressed stream as shared chunks, in stream order.
    pub fn compressed_chunks(&self) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        self.push_chunks(&mut chunks);
        chunks
    }

    /// Reader over the raw compressed stream. Any number of readers can be
    /// open concurrently.
    pub fn reader(&self) -> RecordReader {
        RecordReader {
            chunks: self.compressed_chunks().into_iter(),
            current: None,
        }
    }

    /// Streaming reader over the decompressed content.
    pub fn decompress(&self) -> impl Read {
        // The frames are flushed, never finished; chaining the empty final
        // block gives the decoder a complete stream to terminate on.
        DeflateDecoder::new(self.reader().chain(&STREAM_END[..]))
    }

    /// Decode the decompressed content as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_reader(self.decompress()).map_err(Error::from)
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("etag", &self.body.etag)
            .field("size", &self.body.descriptor.size)
            .field("components", &self.body.components.len())
            .finish()
    }
}

/// Reader over a record's compressed component tree.
pub struct RecordReader {
    chunks: std::vec::IntoIter<Bytes>,
    current: Option<Bytes>,
}

impl Read for RecordReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(chunk) = self.current.as_mut() {
                if chunk.has_remaining() {
                    let n = chunk.remaining().min(buf.len());
                    chunk.copy_to_slice(&mut buf[..n]);
                    return Ok(n);
                }
                self.current = None;
            }
            match self.chunks.next() {
                Some(chunk) => self.current = Some(chunk),
                None => return Ok(0),
            }
        }
    }
}
