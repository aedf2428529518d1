//! Cache and frontend configuration.

use std::time::Duration;

use serde::Deserialize;

/// Level used when a frontend does not pick one; the flate2 default.
const DEFAULT_COMPRESSION_LEVEL: i8 = -1;

/// Limits for a cache.
///
/// Once either limit is exceeded, least recently used records are evicted
/// until the limits hold again. Enforcement is eventual, not immediate;
/// either bound can be exceeded transiently. A zero value disables the
/// corresponding limit.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Maximum memory the cache may hold, in bytes. `0` disables
    /// memory-based eviction.
    pub memory_limit: u64,
    /// Maximum time since a record was last used. `Duration::ZERO` disables
    /// age-based eviction.
    pub lru_limit: Duration,
}

/// Options for creating a frontend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FrontendOptions {
    /// Deflate level for records generated through this frontend. Also
    /// decides the level bits of the zlib header on HTTP delivery.
    pub level: CompressionLevel,
}

/// Deflate compression level in the conventional range.
///
/// `-2` is Huffman-only, `-1` the default, `0` stored (no compression) and
/// `1..=9` increasing effort. Out-of-range levels are rejected up front so
/// serving never has to deal with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "i8")]
pub struct CompressionLevel(i8);

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(DEFAULT_COMPRESSION_LEVEL)
    }
}

impl CompressionLevel {
    /// Validate a raw level.
    pub fn new(level: i8) -> Option<Self> {
        (-2..=9).contains(&level).then_some(Self(level))
    }

    /// The raw level.
    pub fn get(self) -> i8 {
        self.0
    }

    /// The flate2 equivalent. Huffman-only has no flate2 counterpart and
    /// maps to the fastest level.
    pub(crate) fn to_flate2(self) -> flate2::Compression {
        match self.0 {
            -2 => flate2::Compression::fast(),
            -1 => flate2::Compression::default(),
            level => flate2::Compression::new(level as u32),
        }
    }

    /// Level class for the top two bits of zlib header byte 1.
    pub(crate) fn zlib_level_bits(self) -> u8 {
        match self.0 {
            -2 | 0 | 1 => 0,
            2..=5 => 1,
            -1 | 6 => 2,
            _ => 3,
        }
    }
}

impl TryFrom<i8> for CompressionLevel {
    type Error = String;

    fn try_from(level: i8) -> Result<Self, Self::Error> {
        Self::new(level).ok_or_else(|| format!("compression level out of range: {level}"))
    }
}
