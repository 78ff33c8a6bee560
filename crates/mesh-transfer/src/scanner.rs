//! §4.F.1 Scanner: recursively walks a root path, emitting batches of
//! file/dir/symlink entries to the packager over a bounded queue.

use std::path::PathBuf;
use std::sync::Arc;

use mesh_error::MeshError;
use mesh_metadata::EntryFlags;
use mesh_runtime::CancellationToken;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::config::ScanControl;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ScanEntryKind {
    File,
    Directory,
    Symlink,
}

#[derive(Clone, Debug)]
pub struct ScanEntry {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub kind: ScanEntryKind,
    pub size: u64,
    pub last_modified: OffsetDateTime,
    pub time_created: Option<OffsetDateTime>,
    pub flags: EntryFlags,
    pub symlink_target: Option<String>,
}

/// Walks `root`, sending batches of up to `batch_size` entries to `sender`.
/// `control.should_skip` is consulted per directory and per entry so a
/// caller can prune subtrees without touching the filesystem a second time.
/// Dropping `sender` on return signals end-of-input to the packager.
pub async fn run(
    root: PathBuf,
    batch_size: usize,
    control: Arc<dyn ScanControl>,
    sender: mpsc::Sender<Vec<ScanEntry>>,
    cancel: CancellationToken,
) -> Result<(), MeshError> {
    let mut batch = Vec::with_capacity(batch_size);
    let mut stack = vec![(root, String::new())];

    while let Some((dir, rel_dir)) = stack.pop() {
        if cancel.is_cancelled() {
            return Err(MeshError::aborted());
        }
        let mut read_dir = tokio::fs::read_dir(&dir).await.map_err(io_err)?;
        while let Some(entry) = read_dir.next_entry().await.map_err(io_err)? {
            let abs_path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel_path = if rel_dir.is_empty() { name.clone() } else { format!("{rel_dir}/{name}") };
            if control.should_skip(&rel_path) {
                continue;
            }
            let metadata = tokio::fs::symlink_metadata(&abs_path).await.map_err(io_err)?;
            let last_modified = metadata.modified().ok().map(OffsetDateTime::from).unwrap_or(OffsetDateTime::UNIX_EPOCH);
            let time_created = metadata.created().ok().map(OffsetDateTime::from);
            let flags = executable_flags(&metadata);

            if metadata.is_symlink() {
                let target = tokio::fs::read_link(&abs_path).await.map_err(io_err)?;
                batch.push(ScanEntry {
                    rel_path,
                    abs_path,
                    kind: ScanEntryKind::Symlink,
                    size: 0,
                    last_modified,
                    time_created,
                    flags,
                    symlink_target: Some(target.to_string_lossy().into_owned()),
                });
            } else if metadata.is_dir() {
                batch.push(ScanEntry {
                    rel_path: rel_path.clone(),
                    abs_path: abs_path.clone(),
                    kind: ScanEntryKind::Directory,
                    size: 0,
                    last_modified,
                    time_created,
                    flags,
                    symlink_target: None,
                });
                stack.push((abs_path, rel_path));
            } else {
                batch.push(ScanEntry {
                    rel_path,
                    abs_path,
                    kind: ScanEntryKind::File,
                    size: metadata.len(),
                    last_modified,
                    time_created,
                    flags,
                    symlink_target: None,
                });
            }

            if batch.len() >= batch_size {
                if sender.send(std::mem::take(&mut batch)).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    if !batch.is_empty() {
        let _ = sender.send(batch).await;
    }
    Ok(())
}

#[cfg(unix)]
fn executable_flags(metadata: &std::fs::Metadata) -> EntryFlags {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 {
        EntryFlags::EXECUTABLE
    } else {
        EntryFlags::empty()
    }
}

#[cfg(not(unix))]
fn executable_flags(_metadata: &std::fs::Metadata) -> EntryFlags {
    EntryFlags::empty()
}

fn io_err(e: std::io::Error) -> MeshError {
    if mesh_error::io_error_is_expected(e.kind()) {
        MeshError::server(mesh_error::ErrorCode::NotConnected, format!("scan I/O error: {e}"))
    } else {
        MeshError::fatal(format!("scan I/O error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanEverything;

    #[tokio::test]
    async fn walks_nested_files_directories_and_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("root.txt"), b"world").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("root.txt", dir.path().join("link")).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(run(dir.path().to_path_buf(), 16, Arc::new(ScanEverything), tx, CancellationToken::new()));
        let mut all = Vec::new();
        while let Some(batch) = rx.recv().await {
            all.extend(batch);
        }
        handle.await.unwrap().unwrap();

        let names: Vec<_> = all.iter().map(|e| e.rel_path.clone()).collect();
        assert!(names.contains(&"sub".to_string()));
        assert!(names.contains(&"sub/a.txt".to_string()));
        assert!(names.contains(&"root.txt".to_string()));
        #[cfg(unix)]
        assert!(names.contains(&"link".to_string()));
    }

    #[tokio::test]
    async fn skips_paths_the_control_token_rejects() {
        struct SkipSub;
        impl ScanControl for SkipSub {
            fn should_skip(&self, rel_path: &str) -> bool {
                rel_path.starts_with("sub")
            }
        }
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("root.txt"), b"world").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(run(dir.path().to_path_buf(), 16, Arc::new(SkipSub), tx, CancellationToken::new()));
        let mut all = Vec::new();
        while let Some(batch) = rx.recv().await {
            all.extend(batch);
        }
        handle.await.unwrap().unwrap();
        let names: Vec<_> = all.iter().map(|e| e.rel_path.clone()).collect();
        assert_eq!(names, vec!["root.txt".to_string()]);
    }
}
