//! Content-defined chunking with a rolling buzhash window.
//!
//! The chunker is a push-style scanner: callers feed it consecutive slices
//! of a byte stream and it reports where the next cut falls. Cut positions
//! depend only on the stream content, never on how the stream is sliced, so
//! the same data always splits into the same chunks.

use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

/// Width of the rolling window in bytes.
const WINDOW_SIZE: usize = 48;

/// Per-byte hash contributions, derived once from a fixed seed.
static TABLE: LazyLock<[u32; 256]> = LazyLock::new(|| {
    let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
    std::array::from_fn(|_| {
        state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        (z ^ (z >> 31)) as u32
    })
});

/// Chunk size bounds for content-defined splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkConfig {
    /// Minimum chunk size in bytes; no cut happens earlier.
    pub min_size: u32,
    /// Average (expected) chunk size in bytes.
    pub avg_size: u32,
    /// Maximum chunk size in bytes; a cut is forced here.
    pub max_size: u32,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            min_size: 16 * 1024,
            avg_size: 64 * 1024,
            max_size: 256 * 1024,
        }
    }
}

impl ChunkConfig {
    /// Check that the bounds are ordered and non-zero.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.min_size > 0 && self.min_size <= self.avg_size && self.avg_size <= self.max_size
    }
}

/// Rolling-hash scanner for content-defined cut points.
pub struct Chunker {
    config: ChunkConfig,
    discriminator: u32,
    window: [u8; WINDOW_SIZE],
    window_fill: usize,
    cursor: usize,
    hash: u32,
    chunk_size: usize,
}

impl Chunker {
    #[must_use]
    pub fn new(config: ChunkConfig) -> Self {
        // Cuts become possible only after min_size bytes, so the expected
        // chunk length is min_size plus the discriminator.
        let discriminator = config.avg_size.saturating_sub(config.min_size).max(1);
        Self {
            config,
            discriminator,
            window: [0; WINDOW_SIZE],
            window_fill: 0,
            cursor: 0,
            hash: 0,
            chunk_size: 0,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Scan a slice for the next cut.
    ///
    /// Returns the offset one past the cut within `data`, or `None` when no
    /// cut falls inside this slice. State carries over between calls and
    /// resets at every cut, so one long input can be scanned piecewise by
    /// advancing past each returned offset.
    pub fn scan(&mut self, data: &[u8]) -> Option<usize> {
        for (i, &byte) in data.iter().enumerate() {
            if self.push_byte(byte) {
                self.reset_chunk();
                return Some(i + 1);
            }
        }
        None
    }

    /// Roll one byte through the window; true when a cut lands after it.
    fn push_byte(&mut self, byte: u8) -> bool {
        if self.window_fill < WINDOW_SIZE {
            self.window[self.window_fill] = byte;
            self.window_fill += 1;
            self.hash = self.hash.rotate_left(1) ^ TABLE[byte as usize];
        } else {
            let out = self.window[self.cursor];
            self.window[self.cursor] = byte;
            self.cursor = (self.cursor + 1) % WINDOW_SIZE;
            self.hash = self.hash.rotate_left(1)
                ^ TABLE[out as usize].rotate_left(WINDOW_SIZE as u32)
                ^ TABLE[byte as usize];
        }

        self.chunk_size += 1;
        if self.chunk_size >= self.config.max_size as usize {
            return true;
        }
        if self.chunk_size < self.config.min_size as usize {
            return false;
        }
        self.hash % self.discriminator == self.discriminator - 1
    }

    fn reset_chunk(&mut self) {
        self.window_fill = 0;
        self.cursor = 0;
        self.hash = 0;
        self.chunk_size = 0;
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(ChunkConfig::default())
    }
}
