//! The filesystem-metadata artifact store (§3, §4.G): an immutable-once-
//! finalised description of a directory tree's entries, their chunk lists,
//! relative paths, timestamps, permissions, and checksums.
//!
//! This crate does not prescribe an on-disk format (the spec explicitly
//! leaves the chunk store's persistence open, and the metadata artifact
//! follows the same posture); [`Store`] is a process-local, in-memory
//! implementation of the interface, guarded the way
//! `chain/network/src/announce_accounts/mod.rs` guards its cache: a single
//! `parking_lot::Mutex` over plain data, no I/O under the lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use mesh_error::{ErrorCode, MeshError};
use mesh_ids::{crc32, fold_chunk_crcs, ArtifactId, ChunkId, EntryId};
use parking_lot::Mutex;
use time::OffsetDateTime;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EntryType {
    File,
    Directory,
    Symlink,
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Eq, PartialEq, Default, Debug, Hash)]
    pub struct EntryFlags: u8 {
        const EXECUTABLE = 0x1;
    }
}

#[derive(Clone, Debug)]
pub struct EntryInfo {
    pub rel_path: String,
    pub entry_type: EntryType,
    pub size: u64,
    pub time_created: Option<OffsetDateTime>,
    pub last_modified: OffsetDateTime,
    pub flags: EntryFlags,
    /// Set only for `Symlink` entries.
    pub target_path: Option<String>,
    pub checksum: Option<u32>,
}

impl EntryInfo {
    pub fn is_checksum_set(&self) -> bool {
        self.checksum.is_some()
    }
}

/// `{pos, size, checksum}`. `pos` is contiguous across a file's chunks,
/// total `= entry.size`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ChunkInfo {
    pub pos: u64,
    pub size: u64,
    pub checksum: u32,
}

#[derive(Debug)]
struct EntryRecord {
    info: EntryInfo,
    chunks: Vec<(ChunkId, ChunkInfo)>,
}

/// Immutable once finalised; produced by [`Writer`] and handed to
/// [`Store::save`].
#[derive(Debug)]
pub struct Artifact {
    entries: BTreeMap<EntryId, EntryRecord>,
    chunk_to_entry: HashMap<ChunkId, EntryId>,
    file_crc32: Option<u32>,
    finalized: bool,
}

impl Artifact {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            chunk_to_entry: HashMap::new(),
            file_crc32: None,
            finalized: false,
        }
    }
}

/// Accumulates entries and chunks for one artifact. `finalize` is idempotent
/// and rejects any further writes once called.
pub struct Writer {
    artifact: Artifact,
    next_entry: AtomicU64,
}

impl Writer {
    pub fn new() -> Self {
        Self { artifact: Artifact::new(), next_entry: AtomicU64::new(0) }
    }

    pub fn add_entry(&mut self, info: EntryInfo) -> Result<EntryId, MeshError> {
        self.reject_if_finalized()?;
        let id = EntryId::new();
        self.artifact.entries.insert(id, EntryRecord { info, chunks: Vec::new() });
        Ok(id)
    }

    /// Assigns a fresh chunk id and records `{pos, size, checksum}` against
    /// `entry_id`. Invariant 1: a chunk id may belong to at most one entry,
    /// enforced by construction since each call mints a new id.
    pub fn add_chunk(&mut self, entry_id: EntryId, info: ChunkInfo) -> Result<ChunkId, MeshError> {
        self.reject_if_finalized()?;
        let record = self.artifact.entries.get_mut(&entry_id).ok_or_else(|| {
            MeshError::server(ErrorCode::InvalidArgument, format!("unknown entry {entry_id}"))
        })?;
        let chunk_id = ChunkId::new();
        record.chunks.push((chunk_id, info));
        self.artifact.chunk_to_entry.insert(chunk_id, entry_id);
        Ok(chunk_id)
    }

    /// Validates invariant 2 (`sum(chunk.size) = entry.size` for files),
    /// computes the file-level CRC32 over the concatenation of per-chunk
    /// CRC32 words, and marks the artifact immutable. Calling this again is
    /// a no-op.
    pub fn finalize(&mut self) -> Result<(), MeshError> {
        if self.artifact.finalized {
            return Ok(());
        }
        for (entry_id, record) in &self.artifact.entries {
            if record.info.entry_type != EntryType::File {
                continue;
            }
            let sum: u64 = record.chunks.iter().map(|(_, c)| c.size).sum();
            if sum != record.info.size {
                return Err(MeshError::integrity(format!(
                    "entry {entry_id} chunk sizes sum to {sum}, expected {}",
                    record.info.size
                )));
            }
        }
        let all_crcs = self
            .artifact
            .entries
            .values()
            .flat_map(|record| record.chunks.iter().map(|(_, c)| c.checksum));
        self.artifact.file_crc32 = Some(fold_chunk_crcs(all_crcs));
        self.artifact.finalized = true;
        Ok(())
    }

    /// Records `entry_id`'s file-level checksum, the CRC32 folded over its
    /// own chunks' CRC32 words. Callers set this once all of an entry's
    /// chunks have been produced, before `finalize`.
    pub fn set_checksum(&mut self, entry_id: EntryId, checksum: u32) -> Result<(), MeshError> {
        self.reject_if_finalized()?;
        let record = self.artifact.entries.get_mut(&entry_id).ok_or_else(|| {
            MeshError::server(ErrorCode::InvalidArgument, format!("unknown entry {entry_id}"))
        })?;
        record.info.checksum = Some(checksum);
        Ok(())
    }

    fn reject_if_finalized(&self) -> Result<(), MeshError> {
        if self.artifact.finalized {
            return Err(MeshError::server(
                ErrorCode::InvalidArgument,
                "artifact is finalized and accepts no further writes",
            ));
        }
        Ok(())
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view over a saved artifact.
pub struct Reader<'a> {
    artifact: &'a Artifact,
}

impl<'a> Reader<'a> {
    pub fn query_all_entries(&self) -> Vec<EntryId> {
        self.artifact.entries.keys().copied().collect()
    }

    pub fn load_entry_info(&self, entry_id: EntryId) -> Option<&'a EntryInfo> {
        self.artifact.entries.get(&entry_id).map(|r| &r.info)
    }

    pub fn query_chunks_count(&self, entry_id: EntryId) -> usize {
        self.artifact.entries.get(&entry_id).map(|r| r.chunks.len()).unwrap_or(0)
    }

    pub fn query_entry_id(&self, chunk_id: ChunkId) -> Option<EntryId> {
        self.artifact.chunk_to_entry.get(&chunk_id).copied()
    }

    pub fn load_chunk_info(&self, chunk_id: ChunkId) -> Option<ChunkInfo> {
        let entry_id = self.artifact.chunk_to_entry.get(&chunk_id)?;
        let record = self.artifact.entries.get(entry_id)?;
        record.chunks.iter().find(|(id, _)| *id == chunk_id).map(|(_, info)| *info)
    }

    pub fn load_chunks(&self, entry_id: EntryId) -> Vec<(ChunkId, ChunkInfo)> {
        self.artifact.entries.get(&entry_id).map(|r| r.chunks.clone()).unwrap_or_default()
    }

    pub fn query_entries_count(&self) -> usize {
        self.artifact.entries.len()
    }

    pub fn file_crc32(&self) -> Option<u32> {
        self.artifact.file_crc32
    }
}

/// Process-local artifact store. Thread-safe; no I/O is performed while
/// holding the internal lock.
#[derive(Default, Debug)]
pub struct Store {
    inner: Mutex<HashMap<ArtifactId, Artifact>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Saves a finalized writer under a fresh artifact id. Artifact ids are
    /// unique per call by construction (a fresh UUID every time).
    pub fn save(&self, writer: Writer) -> Result<ArtifactId, MeshError> {
        if !writer.artifact.finalized {
            return Err(MeshError::server(
                ErrorCode::InvalidArgument,
                "cannot save an artifact that has not been finalized",
            ));
        }
        let id = ArtifactId::new();
        self.inner.lock().insert(id, writer.artifact);
        tracing::debug!(target: "mesh::metadata", artifact = %id, "saved artifact");
        Ok(id)
    }

    pub fn load(&self, artifact_id: ArtifactId) -> Result<ArtifactHandle, MeshError> {
        let guard = self.inner.lock();
        if !guard.contains_key(&artifact_id) {
            return Err(MeshError::server(
                ErrorCode::NoSuchFileOrDirectory,
                format!("no artifact {artifact_id}"),
            ));
        }
        Ok(ArtifactHandle { store: self, artifact_id })
    }
}

/// A handle that lets callers obtain a [`Reader`] without holding the
/// store's lock across their use of it; the reader itself borrows through a
/// short-lived lock guard per call, matching the "no I/O under the lock"
/// rule (reads here are pure in-memory lookups, so the lock is held only for
/// the duration of the read).
#[derive(Debug)]
pub struct ArtifactHandle<'s> {
    store: &'s Store,
    artifact_id: ArtifactId,
}

impl<'s> ArtifactHandle<'s> {
    pub fn with_reader<R>(&self, f: impl FnOnce(Reader<'_>) -> R) -> R {
        let guard = self.store.inner.lock();
        let artifact = guard.get(&self.artifact_id).expect("artifact present for loaded handle");
        f(Reader { artifact })
    }
}

/// Computes a chunk's CRC32 over its content, for callers assembling a
/// [`ChunkInfo`] from raw bytes.
pub fn chunk_checksum(data: &[u8]) -> u32 {
    crc32(data)
}
