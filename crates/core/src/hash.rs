//! Object identifiers and digest contexts, both SHA-256.

use std::fmt;

use sha2::{Digest, Sha256};

/// Length of an object identifier in bytes.
pub const OBJECT_ID_LEN: usize = 32;

/// A chunk's store key: the SHA-256 digest of its bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    /// Identifier of an arbitrary byte slice.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Wrap a raw 32-byte digest.
    #[must_use]
    pub fn from_raw(raw: [u8; OBJECT_ID_LEN]) -> Self {
        Self(raw)
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }

    /// Convert to a full hex string.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ObjectId({})", hex.get(..16).unwrap_or(&hex))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental SHA-256 over a byte stream.
///
/// Doubles as a reusable per-object context: `object_id` resets the state
/// after finalizing, `peek` reads the running digest without disturbing it.
#[derive(Clone, Default)]
pub struct StreamDigest {
    inner: Sha256,
}

impl StreamDigest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb more stream bytes.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Digest of everything absorbed so far, leaving the running state
    /// untouched so the stream can continue.
    #[must_use]
    pub fn peek(&self) -> ObjectId {
        ObjectId(self.inner.clone().finalize().into())
    }

    /// One-shot identifier of a standalone object, reusing this context.
    ///
    /// The context is reset afterwards; interleaving with `update` on the
    /// same instance mixes the two streams.
    pub fn object_id(&mut self, data: &[u8]) -> ObjectId {
        self.inner.update(data);
        ObjectId(self.inner.finalize_reset().into())
    }
}
