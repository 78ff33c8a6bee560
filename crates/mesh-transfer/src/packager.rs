//! §4.F.2 Packager: assigns entry ids, splits file content into
//! `{pos, size, CRC32}` chunks, emits `DataChunkBlock`s downstream as they
//! are produced, and finalises the metadata artifact at end-of-input.

use std::sync::Arc;

use mesh_error::MeshError;
use mesh_ids::{crc32, fold_chunk_crcs, ArtifactId, ChunkId};
use mesh_metadata::{ChunkInfo, EntryInfo, EntryType, Store, Writer};
use mesh_runtime::CancellationToken;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::chunk_block::DataChunkBlock;
use crate::scanner::{ScanEntry, ScanEntryKind};

/// Consumes scan-entry batches until `entries_rx` closes (scanner
/// end-of-input), emitting one `DataChunkBlock` per file chunk, then
/// finalises and saves the metadata artifact.
pub async fn run(
    mut entries_rx: mpsc::Receiver<Vec<ScanEntry>>,
    chunk_size: usize,
    store: Arc<Store>,
    chunk_tx: mpsc::Sender<DataChunkBlock>,
    cancel: CancellationToken,
) -> Result<ArtifactId, MeshError> {
    let mut writer = Writer::new();

    while let Some(batch) = entries_rx.recv().await {
        for entry in batch {
            if cancel.is_cancelled() {
                return Err(MeshError::aborted());
            }
            package_entry(&mut writer, entry, chunk_size, &chunk_tx, &cancel).await?;
        }
    }

    writer.finalize()?;
    store.save(writer)
}

async fn package_entry(
    writer: &mut Writer,
    entry: ScanEntry,
    chunk_size: usize,
    chunk_tx: &mpsc::Sender<DataChunkBlock>,
    cancel: &CancellationToken,
) -> Result<(), MeshError> {
    let entry_type = match entry.kind {
        ScanEntryKind::File => EntryType::File,
        ScanEntryKind::Directory => EntryType::Directory,
        ScanEntryKind::Symlink => EntryType::Symlink,
    };
    let info = EntryInfo {
        rel_path: entry.rel_path.clone(),
        entry_type,
        size: entry.size,
        time_created: entry.time_created,
        last_modified: entry.last_modified,
        flags: entry.flags,
        target_path: entry.symlink_target.clone(),
        checksum: None,
    };
    let entry_id = writer.add_entry(info)?;

    if entry.kind != ScanEntryKind::File || entry.size == 0 {
        return Ok(());
    }

    let mut file = tokio::fs::File::open(&entry.abs_path).await.map_err(io_err)?;
    let mut pos: u64 = 0;
    let mut crcs = Vec::new();
    let mut buf = vec![0u8; chunk_size];
    loop {
        if cancel.is_cancelled() {
            return Err(MeshError::aborted());
        }
        let read = file.read(&mut buf).await.map_err(io_err)?;
        if read == 0 {
            break;
        }
        let data = buf[..read].to_vec();
        let checksum = crc32(&data);
        let chunk_id: ChunkId = writer.add_chunk(entry_id, ChunkInfo { pos, size: read as u64, checksum })?;
        crcs.push(checksum);
        pos += read as u64;
        if chunk_tx.send(DataChunkBlock { chunk_id, data }).await.is_err() {
            return Err(MeshError::aborted());
        }
    }
    if pos != entry.size {
        return Err(MeshError::integrity(format!(
            "{} changed size while being read: expected {}, read {}",
            entry.rel_path, entry.size, pos
        )));
    }
    writer.set_checksum(entry_id, fold_chunk_crcs(crcs))?;
    Ok(())
}

fn io_err(e: std::io::Error) -> MeshError {
    MeshError::fatal(format!("packager I/O error: {e}"))
}
