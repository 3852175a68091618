//! The synchronizer: a one-shot streaming pipeline coupling the archive
//! encoder/decoder, the rolling-hash chunker, the store hierarchy, the
//! index, and the running archive digest.
//!
//! A [`Synchronizer`] is created in exactly one direction and advanced by
//! repeated [`Synchronizer::step`] calls until `Finished`. Encoding tees
//! every produced slice to the archive sink, the archive digest, and the
//! chunker, in that order; decoding resolves index records through the
//! store cascade and feeds the decoder. Nothing is ever published under a
//! final name except by the rename performed on the finishing step.

use std::fs::{self, File, OpenOptions};
use std::mem;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::chunker::{ChunkConfig, Chunker};
use crate::decode::{BaseKind, Decoder, DecoderStep};
use crate::encode::{Encoder, EncoderStep};
use crate::error::{SyncError, SyncResult};
use crate::hash::{ObjectId, StreamDigest};
use crate::index::{IndexReader, IndexWriter};
use crate::store::Store;
use crate::util::sibling_temp_path;

/// Outcome of one pipeline advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    /// The pipeline completed and committed its outputs.
    Finished,
    /// A file boundary was crossed; `current_path` names the new entry.
    NextFile,
    /// Progress was made.
    Step,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Encode,
    Decode,
}

/// The base endpoint before the pipeline starts.
enum BaseSlot {
    Unset,
    /// File-like handle (regular file or block device), owned until start.
    Fd(File),
    /// Existing directory to encode from.
    DirPath(PathBuf),
    /// Decode target path; materialization waits for `base_mode` at start.
    DeferredPath(PathBuf),
    /// Ownership moved into the encoder or decoder.
    Taken,
}

enum IndexSource {
    Fd(File),
    Path(PathBuf),
}

enum IndexHandle {
    Writer(IndexWriter),
    Reader(IndexReader),
}

enum Active {
    Encode(Encoder),
    Decode(Decoder),
}

/// A single-use encode or decode session. See the module docs.
pub struct Synchronizer {
    direction: Direction,
    active: Option<Active>,

    wstore: Option<Store>,
    rstores: Vec<Store>,

    chunker: Chunker,
    buffer: Vec<u8>,

    base: BaseSlot,
    base_mode: Option<BaseKind>,
    base_final_path: Option<PathBuf>,
    make_perm_mode: Option<u32>,

    archive_fd: Option<File>,
    archive_path: Option<PathBuf>,

    temporary_archive_path: Option<PathBuf>,
    temporary_base_path: Option<PathBuf>,

    object_digest: StreamDigest,
    archive_digest: StreamDigest,

    index_source: Option<IndexSource>,
    index: Option<IndexHandle>,

    eof: bool,
}

impl Synchronizer {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            active: None,
            wstore: None,
            rstores: Vec::new(),
            chunker: Chunker::default(),
            buffer: Vec::new(),
            base: BaseSlot::Unset,
            base_mode: None,
            base_final_path: None,
            make_perm_mode: None,
            archive_fd: None,
            archive_path: None,
            temporary_archive_path: None,
            temporary_base_path: None,
            object_digest: StreamDigest::new(),
            archive_digest: StreamDigest::new(),
            index_source: None,
            index: None,
            eof: false,
        }
    }

    /// A session that turns a base tree into archive, chunks, and index.
    #[must_use]
    pub fn new_encode() -> Self {
        Self::new(Direction::Encode)
    }

    /// A session that reassembles a base tree from archive or index+stores.
    #[must_use]
    pub fn new_decode() -> Self {
        Self::new(Direction::Decode)
    }

    // --- configuration, write-once ---------------------------------------

    /// Use an already opened file-like handle as the base endpoint.
    pub fn set_base_fd(&mut self, fd: File) -> SyncResult<()> {
        if !matches!(self.base, BaseSlot::Unset) || self.base_mode.is_some() {
            return Err(SyncError::Busy("base"));
        }
        self.base = BaseSlot::Fd(fd);
        Ok(())
    }

    /// Use a path as the base endpoint.
    ///
    /// Encoding resolves the path now: a directory is walked, anything else
    /// is opened as a regular file. Decoding only remembers the path; what
    /// gets created there is decided by `base_mode` at start.
    pub fn set_base_path(&mut self, path: impl Into<PathBuf>) -> SyncResult<()> {
        if !matches!(self.base, BaseSlot::Unset) {
            return Err(SyncError::Busy("base"));
        }
        let path = path.into();

        match self.direction {
            Direction::Encode => {
                if fs::metadata(&path)?.is_dir() {
                    self.base = BaseSlot::DirPath(path);
                } else {
                    self.base = BaseSlot::Fd(File::open(&path)?);
                }
            }
            Direction::Decode => {
                self.base = BaseSlot::DeferredPath(path);
            }
        }
        Ok(())
    }

    /// Declare the shape of a decode target that may not exist yet.
    pub fn set_base_mode(&mut self, kind: BaseKind) -> SyncResult<()> {
        if self.direction != Direction::Decode {
            return Err(SyncError::DirectionMismatch);
        }
        if matches!(self.base, BaseSlot::Fd(_)) || self.base_mode.is_some() {
            return Err(SyncError::Busy("base mode"));
        }
        self.base_mode = Some(kind);
        Ok(())
    }

    /// Permission bits for a created archive file; read/write bits only.
    pub fn set_make_perm_mode(&mut self, mode: u32) -> SyncResult<()> {
        if mode & !0o666 != 0 {
            return Err(SyncError::InvalidArgument(
                "archive permissions allow read/write bits only",
            ));
        }
        if self.direction != Direction::Encode {
            return Err(SyncError::DirectionMismatch);
        }
        if self.make_perm_mode.is_some() {
            return Err(SyncError::Busy("archive permission mode"));
        }
        self.make_perm_mode = Some(mode);
        Ok(())
    }

    /// Use an already opened handle as the archive endpoint.
    pub fn set_archive_fd(&mut self, fd: File) -> SyncResult<()> {
        if self.archive_fd.is_some() || self.archive_path.is_some() {
            return Err(SyncError::Busy("archive"));
        }
        self.archive_fd = Some(fd);
        Ok(())
    }

    /// Use a path as the archive endpoint.
    ///
    /// Encoding defers creation: the file appears as a randomized sibling at
    /// start and is renamed into place on the finishing step. Decoding opens
    /// it read-only right away.
    pub fn set_archive_path(&mut self, path: impl Into<PathBuf>) -> SyncResult<()> {
        if self.archive_fd.is_some() || self.archive_path.is_some() {
            return Err(SyncError::Busy("archive"));
        }
        let path = path.into();

        match self.direction {
            Direction::Encode => self.archive_path = Some(path),
            Direction::Decode => self.archive_fd = Some(File::open(&path)?),
        }
        Ok(())
    }

    /// Configure the writable store from a local directory.
    pub fn set_store_local(&mut self, path: impl Into<PathBuf>) -> SyncResult<()> {
        if self.wstore.is_some() {
            return Err(SyncError::Busy("writable store"));
        }
        self.wstore = Some(Store::open_local(path)?);
        Ok(())
    }

    /// Append a read-only seed store; lookups consult seeds in this order
    /// after the writable store misses.
    pub fn add_seed_store_local(&mut self, path: impl Into<PathBuf>) -> SyncResult<()> {
        self.rstores.push(Store::open_seed(path)?);
        Ok(())
    }

    /// Configure the index from a path: written when encoding, read when
    /// decoding.
    pub fn set_index_path(&mut self, path: impl Into<PathBuf>) -> SyncResult<()> {
        if self.index_source.is_some() || self.index.is_some() {
            return Err(SyncError::Busy("index"));
        }
        self.index_source = Some(IndexSource::Path(path.into()));
        Ok(())
    }

    /// Configure the index from an already opened handle.
    pub fn set_index_fd(&mut self, fd: File) -> SyncResult<()> {
        if self.index_source.is_some() || self.index.is_some() {
            return Err(SyncError::Busy("index"));
        }
        self.index_source = Some(IndexSource::Fd(fd));
        Ok(())
    }

    /// Override the chunk size bounds; only possible before the first step.
    pub fn set_chunk_config(&mut self, config: ChunkConfig) -> SyncResult<()> {
        if !config.is_valid() {
            return Err(SyncError::InvalidArgument(
                "chunk sizes must satisfy 0 < min <= avg <= max",
            ));
        }
        if self.active.is_some() {
            return Err(SyncError::Busy("chunker"));
        }
        self.chunker = Chunker::new(config);
        Ok(())
    }

    // --- start-up materialization ----------------------------------------

    /// Materialize deferred resources. Idempotent on success; on failure the
    /// temp paths created in this call are cleared again.
    fn start(&mut self) -> SyncResult<()> {
        match self.direction {
            Direction::Encode => self.start_encode()?,
            Direction::Decode => self.start_decode()?,
        }

        if self.index.is_none() {
            if let Some(source) = self.index_source.take() {
                let handle = match (self.direction, source) {
                    (Direction::Encode, IndexSource::Path(path)) => {
                        match IndexWriter::create(&path) {
                            Ok(writer) => IndexHandle::Writer(writer),
                            Err(e) => {
                                self.index_source = Some(IndexSource::Path(path));
                                return Err(e);
                            }
                        }
                    }
                    (Direction::Encode, IndexSource::Fd(fd)) => {
                        IndexHandle::Writer(IndexWriter::from_file(fd)?)
                    }
                    (Direction::Decode, IndexSource::Path(path)) => {
                        match IndexReader::open(&path) {
                            Ok(reader) => IndexHandle::Reader(reader),
                            Err(e) => {
                                self.index_source = Some(IndexSource::Path(path));
                                return Err(e);
                            }
                        }
                    }
                    (Direction::Decode, IndexSource::Fd(fd)) => {
                        IndexHandle::Reader(IndexReader::from_file(fd)?)
                    }
                };
                self.index = Some(handle);
            }
        }

        Ok(())
    }

    fn start_encode(&mut self) -> SyncResult<()> {
        if self.index_source.is_some() && self.wstore.is_none() && self.index.is_none() {
            return Err(SyncError::InvalidArgument(
                "an index without a writable store would record unreachable chunks",
            ));
        }

        if self.archive_fd.is_none() {
            if let Some(target) = self.archive_path.as_ref() {
                let temp = match &self.temporary_archive_path {
                    Some(temp) => temp.clone(),
                    None => {
                        let temp = sibling_temp_path(target);
                        self.temporary_archive_path = Some(temp.clone());
                        temp
                    }
                };

                let mut options = OpenOptions::new();
                options.write(true).create_new(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    options.mode(self.make_perm_mode.unwrap_or(0o666) & 0o666);
                }
                match options.open(&temp) {
                    Ok(fd) => self.archive_fd = Some(fd),
                    Err(e) => {
                        self.temporary_archive_path = None;
                        return Err(e.into());
                    }
                }
            }
        }

        if self.active.is_none() {
            let encoder = match mem::replace(&mut self.base, BaseSlot::Taken) {
                BaseSlot::Fd(fd) => Encoder::from_file(fd)?,
                BaseSlot::DirPath(path) => match Encoder::from_directory(&path) {
                    Ok(encoder) => encoder,
                    Err(e) => {
                        self.base = BaseSlot::DirPath(path);
                        return Err(e);
                    }
                },
                other => {
                    self.base = other;
                    return Err(SyncError::NotReady("base endpoint"));
                }
            };
            self.active = Some(Active::Encode(encoder));
        }

        Ok(())
    }

    fn start_decode(&mut self) -> SyncResult<()> {
        if self.active.is_some() {
            return Ok(());
        }

        let decoder = match mem::replace(&mut self.base, BaseSlot::Taken) {
            BaseSlot::Fd(fd) => Decoder::with_base_file(fd),
            BaseSlot::DeferredPath(path) => {
                let Some(kind) = self.base_mode else {
                    self.base = BaseSlot::DeferredPath(path);
                    return Err(SyncError::NotReady("base mode"));
                };
                match self.materialize_decode_base(&path, kind) {
                    Ok(decoder) => decoder,
                    Err(e) => {
                        self.base = BaseSlot::DeferredPath(path);
                        return Err(e);
                    }
                }
            }
            BaseSlot::Unset => {
                self.base = BaseSlot::Unset;
                match self.base_mode {
                    Some(kind) => Decoder::with_base_kind(kind),
                    None => return Err(SyncError::NotReady("base endpoint")),
                }
            }
            other => {
                self.base = other;
                return Err(SyncError::NotReady("base endpoint"));
            }
        };
        self.active = Some(Active::Decode(decoder));
        Ok(())
    }

    /// Create the decode target named by `path` according to `kind`.
    fn materialize_decode_base(&mut self, path: &Path, kind: BaseKind) -> SyncResult<Decoder> {
        match kind {
            BaseKind::Directory => {
                if let Err(e) = fs::create_dir(path) {
                    if e.kind() != std::io::ErrorKind::AlreadyExists {
                        return Err(e.into());
                    }
                }
                if !fs::metadata(path)?.is_dir() {
                    return Err(SyncError::InvalidArgument(
                        "decode base path exists but is not a directory",
                    ));
                }
                Ok(Decoder::with_base_dir(path.to_path_buf()))
            }
            BaseKind::Regular => {
                let temp = match &self.temporary_base_path {
                    Some(temp) => temp.clone(),
                    None => {
                        let temp = sibling_temp_path(path);
                        self.temporary_base_path = Some(temp.clone());
                        temp
                    }
                };

                let mut options = OpenOptions::new();
                options.write(true).create_new(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    options.mode(0o777);
                }
                match options.open(&temp) {
                    Ok(fd) => {
                        self.base_final_path = Some(path.to_path_buf());
                        Ok(Decoder::with_base_file(fd))
                    }
                    Err(e) => {
                        self.temporary_base_path = None;
                        Err(e.into())
                    }
                }
            }
            BaseKind::BlockDevice => {
                let fd = OpenOptions::new().write(true).open(path)?;
                Ok(Decoder::with_base_file(fd))
            }
        }
    }

    // --- the step loop ----------------------------------------------------

    /// Advance the pipeline by one bounded unit of work.
    pub fn step(&mut self) -> SyncResult<SyncStep> {
        self.start()?;
        match self.direction {
            Direction::Encode => self.step_encode(),
            Direction::Decode => self.step_decode(),
        }
    }

    fn step_encode(&mut self) -> SyncResult<SyncStep> {
        if self.eof {
            return Err(SyncError::PipelineClosed);
        }

        let (step, data) = {
            let Some(Active::Encode(encoder)) = self.active.as_mut() else {
                return Err(SyncError::DirectionMismatch);
            };
            let step = encoder.step()?;
            let data = match step {
                EncoderStep::Finished => Bytes::new(),
                EncoderStep::NextFile | EncoderStep::Data => encoder.take_data(),
            };
            (step, data)
        };

        match step {
            EncoderStep::Finished => {
                self.write_final_chunk()?;
                if let (Some(temp), Some(target)) =
                    (self.temporary_archive_path.as_ref(), self.archive_path.as_ref())
                {
                    fs::rename(temp, target)?;
                    self.temporary_archive_path = None;
                }
                self.eof = true;
                Ok(SyncStep::Finished)
            }
            EncoderStep::NextFile | EncoderStep::Data => {
                // The tee order is load-bearing: a failing sink write must
                // short-circuit before the digest or the chunker see the
                // slice, and the digest must cover exactly the sink bytes.
                self.write_archive(&data)?;
                self.archive_digest.update(&data);
                self.write_chunks(&data)?;

                Ok(if step == EncoderStep::NextFile {
                    SyncStep::NextFile
                } else {
                    SyncStep::Step
                })
            }
        }
    }

    fn step_decode(&mut self) -> SyncResult<SyncStep> {
        if self.eof {
            return Err(SyncError::PipelineClosed);
        }

        let step = {
            let Some(Active::Decode(decoder)) = self.active.as_mut() else {
                return Err(SyncError::DirectionMismatch);
            };
            decoder.step()?
        };

        match step {
            DecoderStep::Finished => {
                if let (Some(temp), Some(target)) =
                    (self.temporary_base_path.as_ref(), self.base_final_path.as_ref())
                {
                    fs::rename(temp, target)?;
                    self.temporary_base_path = None;
                }
                self.eof = true;
                Ok(SyncStep::Finished)
            }
            DecoderStep::NextFile => Ok(SyncStep::NextFile),
            DecoderStep::Step | DecoderStep::Payload => Ok(SyncStep::Step),
            DecoderStep::Request => {
                self.service_decoder_request()?;
                Ok(SyncStep::Step)
            }
        }
    }

    /// Feed the decoder: the next index record resolved through the store
    /// cascade, or the archive handle for direct streaming.
    fn service_decoder_request(&mut self) -> SyncResult<()> {
        let record = match &mut self.index {
            Some(IndexHandle::Reader(reader)) => Some(reader.read_object()?),
            _ => None,
        };

        match record {
            Some(None) => {
                let Some(Active::Decode(decoder)) = self.active.as_mut() else {
                    return Err(SyncError::DirectionMismatch);
                };
                decoder.put_eof()
            }
            Some(Some((id, index_size))) => {
                let bytes = self.get(&id)?;
                if bytes.len() as u64 != index_size {
                    return Err(SyncError::BadMessage(format!(
                        "object {id} is {} bytes but the index records {index_size}",
                        bytes.len(),
                    )));
                }
                let Some(Active::Decode(decoder)) = self.active.as_mut() else {
                    return Err(SyncError::DirectionMismatch);
                };
                decoder.put_data(&bytes)?;
                // Only bytes the decoder accepted reach the digest.
                self.archive_digest.update(&bytes);
                Ok(())
            }
            None => {
                if let Some(fd) = self.archive_fd.take() {
                    let Some(Active::Decode(decoder)) = self.active.as_mut() else {
                        return Err(SyncError::DirectionMismatch);
                    };
                    return decoder.put_data_fd(fd);
                }
                Err(SyncError::DirectionMismatch)
            }
        }
    }

    // --- chunk fanout -----------------------------------------------------

    fn write_archive(&mut self, data: &[u8]) -> SyncResult<()> {
        use std::io::Write;
        if let Some(fd) = self.archive_fd.as_mut() {
            fd.write_all(data)?;
        }
        Ok(())
    }

    /// Run a produced slice through the chunker, emitting every chunk that
    /// completes inside it. One slice may finish several chunks.
    fn write_chunks(&mut self, data: &Bytes) -> SyncResult<()> {
        if self.wstore.is_none() {
            return Ok(());
        }

        let mut rest: &[u8] = data;
        while !rest.is_empty() {
            match self.chunker.scan(rest) {
                None => {
                    self.buffer.extend_from_slice(rest);
                    return Ok(());
                }
                Some(cut) => {
                    if self.buffer.is_empty() {
                        // The whole chunk lies inside this slice.
                        let (chunk, tail) = rest.split_at(cut);
                        self.emit_chunk(chunk)?;
                        rest = tail;
                    } else {
                        self.buffer.extend_from_slice(&rest[..cut]);
                        let chunk = mem::take(&mut self.buffer);
                        self.emit_chunk(&chunk)?;
                        self.buffer = chunk;
                        self.buffer.clear();
                        rest = &rest[cut..];
                    }
                }
            }
        }
        Ok(())
    }

    fn emit_chunk(&mut self, chunk: &[u8]) -> SyncResult<()> {
        let id = self.object_digest.object_id(chunk);
        let Some(wstore) = &self.wstore else {
            return Ok(());
        };
        wstore.put(&id, chunk)?;
        if let Some(IndexHandle::Writer(writer)) = &mut self.index {
            writer.write_object(&id, chunk.len() as u64)?;
        }
        Ok(())
    }

    /// Flush the buffered tail as the last chunk and finalize the index.
    fn write_final_chunk(&mut self) -> SyncResult<()> {
        if self.wstore.is_none() {
            return Ok(());
        }

        if !self.buffer.is_empty() {
            let chunk = mem::take(&mut self.buffer);
            self.emit_chunk(&chunk)?;
        }

        let digest = self.archive_digest.peek();
        if let Some(IndexHandle::Writer(writer)) = &mut self.index {
            writer.set_digest(digest);
            writer.write_eof()?;
        }
        Ok(())
    }

    // --- object access ----------------------------------------------------

    /// Resolve an object through the writable store, then every seed store
    /// in registration order. The first store that does not miss decides.
    pub fn get(&self, id: &ObjectId) -> SyncResult<Bytes> {
        if let Some(wstore) = &self.wstore {
            if let Some(bytes) = wstore.get(id)? {
                return Ok(bytes);
            }
        }
        for store in &self.rstores {
            if let Some(bytes) = store.get(id)? {
                return Ok(bytes);
            }
        }
        Err(SyncError::NotFound)
    }

    /// Store an object in the writable store under a caller-supplied id.
    pub fn put(&self, id: &ObjectId, data: &[u8]) -> SyncResult<()> {
        let Some(wstore) = &self.wstore else {
            return Err(SyncError::NotReady("writable store"));
        };
        if ObjectId::from_bytes(data) != *id {
            return Err(SyncError::InvalidArgument("object id does not match data"));
        }
        wstore.put(id, data)
    }

    /// Identifier of an arbitrary byte slice, through the session's
    /// reusable digest context.
    pub fn make_object_id(&mut self, data: &[u8]) -> ObjectId {
        self.object_digest.object_id(data)
    }

    /// The digest over the complete archive stream. Only readable once the
    /// pipeline finished, which guarantees it covers every byte.
    pub fn get_digest(&self) -> SyncResult<ObjectId> {
        if !self.eof {
            return Err(SyncError::Busy("archive digest is not final yet"));
        }
        Ok(self.archive_digest.peek())
    }

    // --- progress reporting -----------------------------------------------

    /// Path of the entry currently moving through the pipeline.
    pub fn current_path(&self) -> SyncResult<Option<&Path>> {
        match &self.active {
            Some(Active::Encode(encoder)) => Ok(encoder.current_path()),
            Some(Active::Decode(decoder)) => Ok(decoder.current_path()),
            None => Err(SyncError::DirectionMismatch),
        }
    }

    /// Permission bits of the entry currently moving through the pipeline.
    pub fn current_mode(&self) -> SyncResult<Option<u32>> {
        match &self.active {
            Some(Active::Encode(encoder)) => Ok(encoder.current_mode()),
            Some(Active::Decode(decoder)) => Ok(decoder.current_mode()),
            None => Err(SyncError::DirectionMismatch),
        }
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        if let Some(temp) = self.temporary_archive_path.take() {
            let _ = fs::remove_file(temp);
        }
        if let Some(temp) = self.temporary_base_path.take() {
            let _ = fs::remove_file(temp);
        }
    }
}
