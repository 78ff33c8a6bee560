//! §4.F.5 Unpackager: replays a metadata artifact onto the filesystem.
//!
//! Runs in four passes: (1) create every directory and zero-length file
//! up front, (2) drain incoming chunks until the receiver disconnects,
//! writing each file's content and verifying it as it completes, (3) create
//! symlinks, (4) stamp directory timestamps in reverse lexicographic order
//! so a child's mtime is set before its parent's. All of this happens in a
//! hidden directory beside `target`; a successful run renames it onto
//! `target`, a failed one deletes it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mesh_error::{ErrorCode, MeshError};
use mesh_ids::{ArtifactId, ChunkId, EntryId};
use mesh_metadata::{ChunkInfo, EntryFlags, EntryInfo, EntryType, Store};
use mesh_runtime::CancellationToken;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::chunk_block::DataChunkBlock;
use crate::config::WindowsSymlinkPolicy;

pub async fn run(
    store: &Arc<Store>,
    artifact_id: ArtifactId,
    target: &Path,
    mut chunk_rx: mpsc::Receiver<DataChunkBlock>,
    windows_symlink_policy: WindowsSymlinkPolicy,
    cancel: CancellationToken,
) -> Result<(), MeshError> {
    if !target.is_absolute() {
        return Err(MeshError::server(ErrorCode::InvalidArgument, format!("{} must be absolute", target.display())));
    }
    if tokio::fs::try_exists(target).await.unwrap_or(false) {
        return Err(MeshError::server(ErrorCode::InvalidArgument, format!("{} already exists", target.display())));
    }
    let parent = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| MeshError::server(ErrorCode::InvalidArgument, "target has no parent directory"))?;
    let name = target.file_name().and_then(|n| n.to_str()).unwrap_or("artifact");
    let tmp_dir = parent.join(format!(".{name}.mesh-unpack"));
    tokio::fs::create_dir_all(&tmp_dir).await.map_err(io_err)?;

    match unpack_into(store, artifact_id, &tmp_dir, &mut chunk_rx, windows_symlink_policy, &cancel).await {
        Ok(()) => {
            tokio::fs::rename(&tmp_dir, target).await.map_err(io_err)?;
            Ok(())
        }
        Err(e) => {
            let _ = tokio::fs::remove_dir_all(&tmp_dir).await;
            Err(e)
        }
    }
}

async fn unpack_into(
    store: &Arc<Store>,
    artifact_id: ArtifactId,
    tmp_dir: &Path,
    chunk_rx: &mut mpsc::Receiver<DataChunkBlock>,
    windows_symlink_policy: WindowsSymlinkPolicy,
    cancel: &CancellationToken,
) -> Result<(), MeshError> {
    let handle = store.load(artifact_id)?;
    let entries: Vec<(EntryId, EntryInfo)> = handle.with_reader(|reader| {
        reader
            .query_all_entries()
            .into_iter()
            .filter_map(|id| reader.load_entry_info(id).cloned().map(|info| (id, info)))
            .collect()
    });

    let mut file_workers: HashMap<EntryId, FileWorker> = HashMap::new();
    let mut chunk_owner: HashMap<ChunkId, EntryId> = HashMap::new();

    // Pass 1: directories and zero-length files are entry-only, no chunks
    // to wait on.
    for (entry_id, info) in &entries {
        if cancel.is_cancelled() {
            return Err(MeshError::aborted());
        }
        match info.entry_type {
            EntryType::Directory => {
                tokio::fs::create_dir_all(tmp_dir.join(&info.rel_path)).await.map_err(io_err)?;
            }
            EntryType::File if info.size == 0 => {
                let path = tmp_dir.join(&info.rel_path);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
                }
                tokio::fs::File::create(&path).await.map_err(io_err)?;
                apply_permissions_and_timestamp(&path, info).await?;
            }
            EntryType::File => {
                let chunks = handle.with_reader(|reader| reader.load_chunks(*entry_id));
                for (chunk_id, _) in &chunks {
                    chunk_owner.insert(*chunk_id, *entry_id);
                }
                let path = tmp_dir.join(&info.rel_path);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
                }
                let chunk_infos: HashMap<ChunkId, ChunkInfo> = chunks.into_iter().collect();
                file_workers.insert(*entry_id, FileWorker::new(path, info.clone(), chunk_infos));
            }
            EntryType::Symlink => {}
        }
    }

    // Pass 2: drain chunks until the receiver disconnects.
    let mut finished: std::collections::HashSet<EntryId> = std::collections::HashSet::new();
    while let Some(chunk) = chunk_rx.recv().await {
        if cancel.is_cancelled() {
            return Err(MeshError::aborted());
        }
        let entry_id = *chunk_owner
            .get(&chunk.chunk_id)
            .ok_or_else(|| MeshError::integrity(format!("chunk {} does not belong to this artifact", chunk.chunk_id)))?;
        let worker = file_workers.get_mut(&entry_id).expect("a chunk owner always has a registered worker");
        worker.accept(chunk).await?;
        if worker.is_complete() {
            worker.finish().await?;
            finished.insert(entry_id);
        }
    }
    for (entry_id, worker) in &file_workers {
        if !finished.contains(entry_id) {
            return Err(MeshError::integrity(format!(
                "{} disconnected with {}/{} chunks written",
                worker.info.rel_path, worker.received, worker.chunks_expected
            )));
        }
    }

    // Pass 3: symlinks.
    for (_, info) in &entries {
        if info.entry_type == EntryType::Symlink {
            create_symlink(tmp_dir, info, windows_symlink_policy)?;
        }
    }

    // Pass 4: directory timestamps, children before parents.
    let mut dirs: Vec<&EntryInfo> =
        entries.iter().map(|(_, info)| info).filter(|info| info.entry_type == EntryType::Directory).collect();
    dirs.sort_by(|a, b| b.rel_path.cmp(&a.rel_path));
    for info in dirs {
        apply_timestamp(&tmp_dir.join(&info.rel_path), info).await?;
    }

    Ok(())
}

/// One file's worker state: tracks the next expected write offset so
/// contiguity falls out of the check itself (a chunk can only land if its
/// `pos` equals the running end of everything written so far), folds the
/// per-chunk CRCs as they arrive for the file-level check at the end.
struct FileWorker {
    path: PathBuf,
    info: EntryInfo,
    chunk_infos: HashMap<ChunkId, ChunkInfo>,
    chunks_expected: usize,
    received: usize,
    next_pos: u64,
    crcs: Vec<u32>,
    file: Option<tokio::fs::File>,
}

impl FileWorker {
    fn new(path: PathBuf, info: EntryInfo, chunk_infos: HashMap<ChunkId, ChunkInfo>) -> Self {
        let chunks_expected = chunk_infos.len();
        Self { path, info, chunk_infos, chunks_expected, received: 0, next_pos: 0, crcs: Vec::new(), file: None }
    }

    async fn accept(&mut self, chunk: DataChunkBlock) -> Result<(), MeshError> {
        let info = self
            .chunk_infos
            .get(&chunk.chunk_id)
            .copied()
            .ok_or_else(|| MeshError::integrity(format!("unexpected chunk for {}", self.info.rel_path)))?;
        let checksum = mesh_ids::crc32(&chunk.data);
        if checksum != info.checksum {
            return Err(MeshError::integrity(format!("chunk of {} failed CRC32 verification", self.info.rel_path)));
        }
        if info.pos != self.next_pos {
            return Err(MeshError::integrity(format!(
                "chunk of {} is not contiguous with the preceding write",
                self.info.rel_path
            )));
        }
        if self.file.is_none() {
            self.file = Some(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&self.path)
                    .await
                    .map_err(io_err)?,
            );
        }
        let file = self.file.as_mut().expect("opened above");
        file.seek(std::io::SeekFrom::Start(info.pos)).await.map_err(io_err)?;
        file.write_all(&chunk.data).await.map_err(io_err)?;
        self.next_pos += info.size;
        self.crcs.push(checksum);
        self.received += 1;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.received == self.chunks_expected
    }

    async fn finish(&mut self) -> Result<(), MeshError> {
        if self.next_pos != self.info.size {
            return Err(MeshError::integrity(format!(
                "{} totals {} bytes written, expected {}",
                self.info.rel_path, self.next_pos, self.info.size
            )));
        }
        if let Some(expected) = self.info.checksum {
            let folded = mesh_ids::fold_chunk_crcs(self.crcs.iter().copied());
            if folded != expected {
                return Err(MeshError::integrity(format!("{} failed file-level CRC32 verification", self.info.rel_path)));
            }
        }
        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(io_err)?;
        }
        apply_permissions_and_timestamp(&self.path, &self.info).await
    }
}

fn create_symlink(tmp_dir: &Path, info: &EntryInfo, policy: WindowsSymlinkPolicy) -> Result<(), MeshError> {
    let path = tmp_dir.join(&info.rel_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let target = info
        .target_path
        .as_deref()
        .ok_or_else(|| MeshError::integrity(format!("symlink entry {} has no target recorded", info.rel_path)))?;

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, &path).map_err(io_err)?;
    }

    #[cfg(not(unix))]
    {
        match policy {
            WindowsSymlinkPolicy::Error => {
                return Err(MeshError::server(
                    ErrorCode::ProtocolNotSupported,
                    format!("cannot create symlink entry {} on this platform", info.rel_path),
                ));
            }
            WindowsSymlinkPolicy::SilentIgnore => {}
            WindowsSymlinkPolicy::WarnAndIgnore => {
                tracing::warn!(target: "mesh::transfer", entry = %info.rel_path, "ignoring symlink entry on a non-unix target");
            }
            WindowsSymlinkPolicy::SilentCreateFile => {
                std::fs::write(&path, target.as_bytes()).map_err(io_err)?;
            }
            WindowsSymlinkPolicy::WarnAndCreateFile => {
                tracing::warn!(target: "mesh::transfer", entry = %info.rel_path, "creating a placeholder file for a symlink entry on a non-unix target");
                std::fs::write(&path, target.as_bytes()).map_err(io_err)?;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = policy;
    Ok(())
}

async fn apply_permissions_and_timestamp(path: &Path, info: &EntryInfo) -> Result<(), MeshError> {
    apply_permissions(path, info).await?;
    apply_timestamp(path, info).await
}

async fn apply_permissions(path: &Path, info: &EntryInfo) -> Result<(), MeshError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if info.flags.contains(EntryFlags::EXECUTABLE) { 0o755 } else { 0o644 };
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await.map_err(io_err)?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, info);
    }
    Ok(())
}

/// Sets a path's modification time via a short-lived file handle, good for
/// both regular files and directories since the underlying syscall only
/// needs a valid descriptor, not a writable one.
async fn apply_timestamp(path: &Path, info: &EntryInfo) -> Result<(), MeshError> {
    let modified: std::time::SystemTime = info.last_modified.into();
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::OpenOptions::new().read(true).open(&path)?;
        file.set_modified(modified)
    })
    .await
    .map_err(|e| MeshError::fatal(format!("timestamp task join error: {e}")))?
    .map_err(io_err)
}

fn io_err(e: std::io::Error) -> MeshError {
    MeshError::fatal(format!("unpackager I/O error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_ids::crc32;
    use mesh_metadata::Writer;
    use time::OffsetDateTime;

    fn file_info(rel_path: &str, size: u64) -> EntryInfo {
        EntryInfo {
            rel_path: rel_path.to_string(),
            entry_type: EntryType::File,
            size,
            time_created: None,
            last_modified: OffsetDateTime::UNIX_EPOCH,
            flags: EntryFlags::empty(),
            target_path: None,
            checksum: None,
        }
    }

    #[tokio::test]
    async fn unpacks_files_directories_and_symlinks_into_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out");

        let store = Arc::new(Store::new());
        let mut writer = Writer::new();
        writer
            .add_entry(EntryInfo {
                rel_path: "sub".into(),
                entry_type: EntryType::Directory,
                size: 0,
                time_created: None,
                last_modified: OffsetDateTime::UNIX_EPOCH,
                flags: EntryFlags::empty(),
                target_path: None,
                checksum: None,
            })
            .unwrap();
        let file_entry = writer.add_entry(file_info("sub/a.bin", 8)).unwrap();
        let chunk_a = writer.add_chunk(file_entry, ChunkInfo { pos: 0, size: 4, checksum: crc32(b"abcd") }).unwrap();
        let chunk_b = writer.add_chunk(file_entry, ChunkInfo { pos: 4, size: 4, checksum: crc32(b"efgh") }).unwrap();
        writer.set_checksum(file_entry, mesh_ids::fold_chunk_crcs([crc32(b"abcd"), crc32(b"efgh")])).unwrap();
        #[cfg(unix)]
        writer
            .add_entry(EntryInfo {
                rel_path: "link".into(),
                entry_type: EntryType::Symlink,
                size: 0,
                time_created: None,
                last_modified: OffsetDateTime::UNIX_EPOCH,
                flags: EntryFlags::empty(),
                target_path: Some("sub/a.bin".into()),
                checksum: None,
            })
            .unwrap();
        writer.finalize().unwrap();
        let artifact_id = store.save(writer).unwrap();

        let (tx, rx) = mpsc::channel(4);
        tx.send(DataChunkBlock { chunk_id: chunk_b, data: b"efgh".to_vec() }).await.unwrap();
        tx.send(DataChunkBlock { chunk_id: chunk_a, data: b"abcd".to_vec() }).await.unwrap();
        drop(tx);

        let err = run(&store, artifact_id, &target, rx, WindowsSymlinkPolicy::Error, CancellationToken::new())
            .await
            .unwrap_err();
        // Chunks arrived out of pos order, so contiguity must reject the
        // second write, proving the check is load-bearing.
        assert_eq!(err.code, ErrorCode::IntegrityMismatch);
        assert!(!tokio::fs::try_exists(&target).await.unwrap());

        let (tx, rx) = mpsc::channel(4);
        tx.send(DataChunkBlock { chunk_id: chunk_a, data: b"abcd".to_vec() }).await.unwrap();
        tx.send(DataChunkBlock { chunk_id: chunk_b, data: b"efgh".to_vec() }).await.unwrap();
        drop(tx);

        run(&store, artifact_id, &target, rx, WindowsSymlinkPolicy::Error, CancellationToken::new()).await.unwrap();

        let content = tokio::fs::read(target.join("sub/a.bin")).await.unwrap();
        assert_eq!(content, b"abcdefgh");
        assert!(tokio::fs::try_exists(target.join("sub")).await.unwrap());
        #[cfg(unix)]
        {
            let link_target = tokio::fs::read_link(target.join("link")).await.unwrap();
            assert_eq!(link_target, PathBuf::from("sub/a.bin"));
        }
    }

    #[tokio::test]
    async fn a_failed_unpack_leaves_no_trace_at_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out");

        let store = Arc::new(Store::new());
        let mut writer = Writer::new();
        let file_entry = writer.add_entry(file_info("a.bin", 4)).unwrap();
        let chunk_id = writer.add_chunk(file_entry, ChunkInfo { pos: 0, size: 4, checksum: crc32(b"abcd") }).unwrap();
        writer.finalize().unwrap();
        let artifact_id = store.save(writer).unwrap();

        let (tx, rx) = mpsc::channel(4);
        tx.send(DataChunkBlock { chunk_id, data: b"wxyz".to_vec() }).await.unwrap();
        drop(tx);

        let err = run(&store, artifact_id, &target, rx, WindowsSymlinkPolicy::Error, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::IntegrityMismatch);
        assert!(!tokio::fs::try_exists(&target).await.unwrap());
        assert!(!tokio::fs::try_exists(dir.path().join(".out.mesh-unpack")).await.unwrap());
    }
}
