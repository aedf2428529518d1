//! Deflate frame descriptors.
//!
//! A frame descriptor tracks the uncompressed size and Adler-32 checksum of
//! one deflate frame. Descriptors compose under byte-stream concatenation,
//! which is what lets a record's frames (and the frames of every record it
//! includes) be served as one deflate stream with a single trailing
//! checksum, without recompressing anything.

/// Largest prime smaller than 65536; the Adler-32 modulus.
const BASE: u32 = 65521;

/// Size and Adler-32 checksum of one uncompressed byte range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FrameDescriptor {
    /// Uncompressed byte length. Wraps on overflow, mirroring zlib.
    pub size: u32,
    /// Adler-32 over the uncompressed bytes.
    pub checksum: u32,
}

impl FrameDescriptor {
    /// Extend `self` so it describes `self`'s bytes followed by `rhs`'s.
    ///
    /// Checksum merging follows the `adler32_combine()` recurrence from
    /// zlib; both halves of the sum are recombined modulo 65521, so the
    /// result stays valid even when `size` wraps.
    pub fn combine(&mut self, rhs: FrameDescriptor) {
        let rem = rhs.size % BASE;
        let mut sum1 = self.checksum & 0xffff;
        let mut sum2 = (rem * sum1) % BASE;
        sum1 += (rhs.checksum & 0xffff) + BASE - 1;
        sum2 += ((self.checksum >> 16) & 0xffff) + ((rhs.checksum >> 16) & 0xffff) + BASE - rem;
        if sum1 >= BASE {
            sum1 -= BASE;
        }
        if sum1 >= BASE {
            sum1 -= BASE;
        }
        if sum2 >= BASE << 1 {
            sum2 -= BASE << 1;
        }
        if sum2 >= BASE {
            sum2 -= BASE;
        }
        self.size = self.size.wrapping_add(rhs.size);
        self.checksum = sum1 | (sum2 << 16);
    }
}
