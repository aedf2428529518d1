//! Record writer handed to generators.

use std::io::{self, Read, Write};
use std::mem;

use adler32::RollingAdler32;
use bytes::Bytes;
use flate2::{Compress, FlushCompress};
use serde::de::DeserializeOwned;
use sha1::{Digest, Sha1};

use crate::cache::register_dependency;
use crate::component::{Component, ComponentList, Frame, Reference};
use crate::config::CompressionLevel;
use crate::error::Error;
use crate::frame::FrameDescriptor;
use crate::frontend::Frontend;
use crate::key::{GlobalLocation, Key, KeyHandle};
use crate::record::Record;

/// Spare output capacity kept ahead of the deflate state.
const MIN_SPARE: usize = 1024;

/// Builds a record on behalf of a generator.
///
/// Raw writes are piped through a deflate encoder into the frame being
/// built; `include` and `bind` finish that frame and resolve another
/// record, blocking until it is ready. The deflate state, checksum and
/// buffers are reset between frames rather than reallocated.
///
/// Each frame is sync-flushed, never finished, so the frames of a record
/// tree concatenate into one valid deflate stream terminated by a single
/// trailing empty block.
pub struct RecordWriter {
    loc: GlobalLocation,
    level: CompressionLevel,
    /// A frame is open and accepting writes.
    compressing: bool,
    compressor: Option<Compress>,
    frame: Vec<u8>,
    frame_size: u32,
    hasher: RollingAdler32,
    components: ComponentList,
}

impl RecordWriter {
    pub(crate) fn new(loc: GlobalLocation, level: CompressionLevel) -> Self {
        Self {
            loc,
            level,
            compressing: false,
            compressor: None,
            frame: Vec::new(),
            frame_size: 0,
            hasher: RollingAdler32::new(),
            components: ComponentList::new(),
        }
    }

    /// Copy the entire contents of `reader` into the record. Stops cleanly
    /// at end of stream.
    pub fn read_from(&mut self, reader: &mut (impl Read + ?Sized)) -> io::Result<u64> {
        io::copy(reader, self)
    }

    /// Include another record's content in this record's stream and bind
    /// this record's lifetime to it: eviction of the included record
    /// cascades to this one. Blocks until the included record is ready; a
    /// failed population propagates as this generator's error.
    pub fn include<K: Key>(&mut self, frontend: &Frontend<K>, key: K) -> Result<(), Error> {
        let record = self.bind_record(frontend, key)?;
        self.components.push(Component::Reference(Reference { record }));
        Ok(())
    }

    /// Depend on another record without splicing its content into this
    /// record's stream. Returns the record for direct reading; the eviction
    /// binding is the same as with [`RecordWriter::include`].
    pub fn bind<K: Key>(&mut self, frontend: &Frontend<K>, key: K) -> Result<Record, Error> {
        self.bind_record(frontend, key)
    }

    /// [`RecordWriter::bind`] and decode the bound record as JSON.
    pub fn bind_json<K: Key, T: DeserializeOwned>(
        &mut self,
        frontend: &Frontend<K>,
        key: K,
    ) -> Result<T, Error> {
        self.bind(frontend, key)?.decode_json()
    }

    fn bind_record<K: Key>(&mut self, frontend: &Frontend<K>, key: K) -> Result<Record, Error> {
        // Finish any pending buffer writes first.
        self.flush_frame()?;

        let key = KeyHandle::new(key);
        debug_assert!(
            !(self.loc.cache == frontend.cache_id()
                && self.loc.frontend == frontend.id()
                && self.loc.key == key),
            "record cannot include itself"
        );

        let record = frontend.get_by_handle(key.clone())?;
        register_dependency(
            self.loc.clone(),
            GlobalLocation {
                cache: frontend.cache_id(),
                frontend: frontend.id(),
                key,
            },
        );
        Ok(record)
    }

    /// Final flush at generator return. Rejects records with no components.
    pub(crate) fn finish(mut self) -> Result<ComponentList, Error> {
        self.flush_frame()?;
        if self.components.is_empty() {
            return Err(Error::EmptyRecord);
        }
        Ok(self.components)
    }

    /// Finish the open frame, if any: sync-flush the deflate stream to a
    /// byte boundary and seal the buffer into a frame component.
    pub(crate) fn flush_frame(&mut self) -> io::Result<()> {
        if !self.compressing {
            return Ok(());
        }
        self.deflate(&[], FlushCompress::Sync)?;

        let data = mem::take(&mut self.frame);
        let hash: [u8; 20] = Sha1::digest(&data).into();
        self.components.push(Component::Frame(Frame {
            descriptor: FrameDescriptor {
                size: self.frame_size,
                checksum: self.hasher.hash(),
            },
            hash,
            data: Bytes::from(data),
        }));
        self.compressing = false;
        Ok(())
    }

    /// Open a new frame unless one is already open, reusing the deflate
    /// state from previous frames.
    fn begin_frame(&mut self) {
        if self.compressing {
            return;
        }
        match self.compressor.as_mut() {
            Some(compressor) => compressor.reset(),
            None => self.compressor = Some(Compress::new(self.level.to_flate2(), false)),
        }
        self.frame.clear();
        self.frame_size = 0;
        self.hasher = RollingAdler32::new();
        self.compressing = true;
    }

    /// Run `input` through the deflate state into the frame buffer.
    fn deflate(&mut self, mut input: &[u8], flush: FlushCompress) -> io::Result<()> {
        let Some(compressor) = self.compressor.as_mut() else {
            return Ok(());
        };
        loop {
            self.frame.reserve(MIN_SPARE);
            let before = compressor.total_in();
            compressor
                .compress_vec(input, &mut self.frame, flush)
                .map_err(io::Error::other)?;
            input = &input[(compressor.total_in() - before) as usize..];

            // Done once all input is consumed and deflate stopped short of
            // the spare output space.
            if input.is_empty() && self.frame.len() < self.frame.capacity() {
                return Ok(());
            }
        }
    }
}

impl Write for RecordWriter {
    /// Compress `buf` into the record. Reports the raw byte count, not the
    /// compressed one.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.begin_frame();
        self.deflate(buf, FlushCompress::None)?;
        self.frame_size = self.frame_size.wrapping_add(buf.len() as u32);
        self.hasher.update_buffer(buf);
        Ok(buf.len())
    }

    /// Frame boundaries are driven by `include`/`bind` and finalization; a
    /// plain I/O flush is a no-op.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
