//! arcsync-core: content-addressed archiving and synchronization engine
//!
//! Turns a filesystem tree into a linear archive stream, splits that stream
//! into content-defined chunks stored under their SHA-256 ids, and writes an
//! index of the chunk sequence — or runs the whole pipeline in reverse to
//! materialize the tree again. The [`sync::Synchronizer`] couples all the
//! pieces into one step-driven session.

pub mod chunker;
pub mod decode;
pub mod encode;
pub mod error;
mod format;
pub mod hash;
pub mod index;
pub mod store;
pub mod sync;
mod util;

pub use chunker::{ChunkConfig, Chunker};
pub use decode::{BaseKind, Decoder, DecoderStep};
pub use encode::{Encoder, EncoderStep};
pub use error::{SyncError, SyncResult};
pub use hash::ObjectId;
pub use index::{IndexReader, IndexWriter};
pub use store::Store;
pub use sync::{SyncStep, Synchronizer};
