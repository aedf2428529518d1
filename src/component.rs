//! Record components.
//!
//! A record's data is an ordered list of components: deflate frames owned
//! by the record, and references that splice another record's frames into
//! the stream. References charge no memory to the including record; those
//! bytes are accounted once, at the record that owns them.

use bytes::Bytes;
use smallvec::SmallVec;

use crate::frame::FrameDescriptor;
use crate::record::Record;

/// SHA-1 digest of component content.
pub(crate) type ContentHash = [u8; 20];

/// Most records hold exactly one frame; the inline capacity keeps that path
/// free of a separate list allocation.
pub(crate) type ComponentList = SmallVec<[Component; 1]>;

pub(crate) enum Component {
    /// One deflate-compressed frame.
    Frame(Frame),
    /// The full component tree of another record.
    Reference(Reference),
}

pub(crate) struct Frame {
    pub data: Bytes,
    pub descriptor: FrameDescriptor,
    pub hash: ContentHash,
}

pub(crate) struct Reference {
    pub record: Record,
}

impl Component {
    pub(crate) fn descriptor(&self) -> FrameDescriptor {
        match self {
            Component::Frame(frame) => frame.descriptor,
            Component::Reference(reference) => reference.record.descriptor(),
        }
    }

    pub(crate) fn hash(&self) -> ContentHash {
        match self {
            Component::Frame(frame) => frame.hash,
            Component::Reference(reference) => reference.record.sha1(),
        }
    }

    /// Memory charged to the owning record.
    pub(crate) fn size(&self) -> usize {
        match self {
            Component::Frame(frame) => frame.data.len(),
            Component::Reference(_) => 0,
        }
    }

    /// Append this component's compressed bytes in stream order.
    pub(crate) fn push_chunks(&self, out: &mut Vec<Bytes>) {
        match self {
            Component::Frame(frame) => out.push(frame.data.clone()),
            Component::Reference(reference) => reference.record.push_chunks(out),
        }
    }
}
