use crate::error::{RelayError, Result};
use bytes::Bytes;
use huddle_protocol::FileEntry;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Longest accepted filename, in bytes
const MAX_FILENAME_LEN: usize = 255;

struct StoredFile {
    entry: FileEntry,
    path: PathBuf,
}

struct InFlight {
    session: String,
    filename: String,
    owner: Uuid,
    part_path: PathBuf,
}

/// An upload being written; owned by the handler of the uploading connection
pub struct Upload {
    id: Uuid,
    session: String,
    filename: String,
    owner: Uuid,
    sender: String,
    declared_size: u64,
    received: u64,
    file: fs::File,
    part_path: PathBuf,
}

/// An upload that is complete on disk but not yet listed
#[derive(Debug)]
pub struct FinishedUpload {
    session: String,
    owner: Uuid,
    entry: FileEntry,
    path: PathBuf,
}

/// A download in progress; independent of every other transfer
pub struct Download {
    filename: String,
    size: u64,
    offset: u64,
    chunk_size: usize,
    file: fs::File,
}

impl Download {
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read the next chunk as `(offset, bytes)`; `None` once the file is done
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<(u64, Bytes)>> {
        if self.offset >= self.size {
            return Ok(None);
        }

        let len = (self.size - self.offset).min(self.chunk_size as u64) as usize;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf).await?;

        let offset = self.offset;
        self.offset += len as u64;
        Ok(Some((offset, Bytes::from(buf))))
    }
}

/// Staging, completion and inventory of session files
///
/// Uploads are written to `{id}.part` and renamed to `{id}.bin` on
/// completion; only then does the file enter the inventory. A partial file is
/// never listed or downloadable.
pub struct FileTransferCoordinator {
    storage_dir: PathBuf,
    max_file_size: u64,
    chunk_size: usize,
    inventory: RwLock<HashMap<String, HashMap<String, StoredFile>>>,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
}

impl FileTransferCoordinator {
    pub fn new(storage_dir: PathBuf, max_file_size: u64, chunk_size: usize) -> Self {
        Self {
            storage_dir,
            max_file_size,
            chunk_size,
            inventory: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Create the storage directory and remove files left by a previous run
    pub async fn prepare(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.storage_dir).await?;

        let mut entries = fs::read_dir(&self.storage_dir).await?;
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let stale = path
                .extension()
                .is_some_and(|ext| ext == "part" || ext == "bin");
            if stale && fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!("Removed {} leftover files from {:?}", removed, self.storage_dir);
        }
        Ok(())
    }

    pub async fn begin_upload(
        &self,
        session: &str,
        filename: &str,
        declared_size: u64,
        owner: Uuid,
        sender: &str,
    ) -> Result<Upload> {
        validate_filename(filename)?;
        if declared_size > self.max_file_size {
            return Err(RelayError::FileTooLarge {
                size: declared_size,
                limit: self.max_file_size,
            });
        }

        let id = Uuid::new_v4();
        let part_path = self.storage_dir.join(format!("{}.part", id));
        {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight
                .values()
                .any(|u| u.session == session && u.filename == filename)
            {
                return Err(RelayError::UploadInProgress(filename.to_string()));
            }
            in_flight.insert(
                id,
                InFlight {
                    session: session.to_string(),
                    filename: filename.to_string(),
                    owner,
                    part_path: part_path.clone(),
                },
            );
        }

        let file = match fs::File::create(&part_path).await {
            Ok(file) => file,
            Err(e) => {
                self.in_flight.lock().await.remove(&id);
                return Err(e.into());
            }
        };

        tracing::info!(
            session,
            participant = %owner,
            "Upload of {} ({} bytes) started",
            filename,
            declared_size
        );
        Ok(Upload {
            id,
            session: session.to_string(),
            filename: filename.to_string(),
            owner,
            sender: sender.to_string(),
            declared_size,
            received: 0,
            file,
            part_path,
        })
    }

    pub async fn write_chunk(&self, upload: &mut Upload, data: &[u8]) -> Result<()> {
        let total = upload.received + data.len() as u64;
        if total > upload.declared_size {
            return Err(RelayError::FileOverrun {
                filename: upload.filename.clone(),
                declared: upload.declared_size,
            });
        }

        upload.file.write_all(data).await?;
        upload.received = total;
        tracing::trace!(
            "Upload {}: {}/{} bytes",
            upload.filename,
            upload.received,
            upload.declared_size
        );
        Ok(())
    }

    /// Seal a fully received upload: sync it and move it to its final name
    ///
    /// Fails with `UploadIncomplete` when the byte count is short, or when the
    /// upload was discarded in the meantime; the partial file is removed. The
    /// result is not listed until it is passed to [`publish`](Self::publish).
    pub async fn complete_upload(&self, mut upload: Upload) -> Result<FinishedUpload> {
        if upload.received != upload.declared_size {
            let err = RelayError::UploadIncomplete {
                filename: upload.filename.clone(),
                received: upload.received,
                declared: upload.declared_size,
            };
            self.discard_upload(upload).await;
            return Err(err);
        }

        if let Err(e) = finish_file(&mut upload.file).await {
            self.discard_upload(upload).await;
            return Err(e.into());
        }

        if self.in_flight.lock().await.remove(&upload.id).is_none() {
            let _ = fs::remove_file(&upload.part_path).await;
            return Err(RelayError::UploadIncomplete {
                filename: upload.filename,
                received: upload.received,
                declared: upload.declared_size,
            });
        }

        let final_path = self.storage_dir.join(format!("{}.bin", upload.id));
        if let Err(e) = fs::rename(&upload.part_path, &final_path).await {
            let _ = fs::remove_file(&upload.part_path).await;
            return Err(e.into());
        }

        Ok(FinishedUpload {
            session: upload.session,
            owner: upload.owner,
            entry: FileEntry {
                filename: upload.filename,
                size: upload.declared_size,
                sender: upload.sender,
            },
            path: final_path,
        })
    }

    /// List a sealed upload in its session's inventory
    ///
    /// A file with the same name is replaced and its stored copy deleted.
    pub async fn publish(&self, finished: FinishedUpload) -> FileEntry {
        let FinishedUpload {
            session,
            owner,
            entry,
            path,
        } = finished;

        let replaced = self
            .inventory
            .write()
            .await
            .entry(session.clone())
            .or_default()
            .insert(
                entry.filename.clone(),
                StoredFile {
                    entry: entry.clone(),
                    path,
                },
            );
        if let Some(old) = replaced {
            let _ = fs::remove_file(&old.path).await;
        }

        tracing::info!(
            session = %session,
            participant = %owner,
            "Upload of {} complete ({} bytes)",
            entry.filename,
            entry.size
        );
        entry
    }

    /// Abort an upload and delete its partial file
    pub async fn discard_upload(&self, upload: Upload) {
        self.in_flight.lock().await.remove(&upload.id);
        drop(upload.file);
        if let Err(e) = fs::remove_file(&upload.part_path).await {
            tracing::debug!("Failed to remove {:?}: {}", upload.part_path, e);
        }
        tracing::info!(
            session = %upload.session,
            participant = %upload.owner,
            "Upload of {} discarded after {} bytes",
            upload.filename,
            upload.received
        );
    }

    /// Abort every upload owned by a participant; returns how many there were
    pub async fn discard_owner(&self, owner: Uuid) -> usize {
        let orphaned: Vec<InFlight> = {
            let mut in_flight = self.in_flight.lock().await;
            let ids: Vec<Uuid> = in_flight
                .iter()
                .filter(|(_, u)| u.owner == owner)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| in_flight.remove(id)).collect()
        };

        for upload in &orphaned {
            let _ = fs::remove_file(&upload.part_path).await;
        }
        orphaned.len()
    }

    /// Completed files of a session, sorted by name
    pub async fn inventory(&self, session: &str) -> Vec<FileEntry> {
        let inventory = self.inventory.read().await;
        let mut files: Vec<FileEntry> = inventory
            .get(session)
            .map(|files| files.values().map(|f| f.entry.clone()).collect())
            .unwrap_or_default();
        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        files
    }

    pub async fn begin_download(&self, session: &str, filename: &str) -> Result<Download> {
        let (size, path) = {
            let inventory = self.inventory.read().await;
            let stored = inventory
                .get(session)
                .and_then(|files| files.get(filename))
                .ok_or_else(|| RelayError::FileNotFound(filename.to_string()))?;
            (stored.entry.size, stored.path.clone())
        };

        let file = fs::File::open(&path).await.map_err(|e| {
            tracing::warn!("Stored file {:?} for {} unreadable: {}", path, filename, e);
            RelayError::FileNotFound(filename.to_string())
        })?;

        Ok(Download {
            filename: filename.to_string(),
            size,
            offset: 0,
            chunk_size: self.chunk_size,
            file,
        })
    }

    /// Delete everything belonging to a destroyed session
    pub async fn drop_session(&self, session: &str) {
        let stored = self.inventory.write().await.remove(session);
        let orphaned: Vec<InFlight> = {
            let mut in_flight = self.in_flight.lock().await;
            let ids: Vec<Uuid> = in_flight
                .iter()
                .filter(|(_, u)| u.session == session)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| in_flight.remove(id)).collect()
        };

        let mut removed = 0;
        for file in stored.into_iter().flat_map(|files| files.into_values()) {
            if fs::remove_file(&file.path).await.is_ok() {
                removed += 1;
            }
        }
        for upload in orphaned {
            let _ = fs::remove_file(&upload.part_path).await;
        }

        if removed > 0 {
            tracing::info!(session, "Deleted {} session files", removed);
        }
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

async fn finish_file(file: &mut fs::File) -> std::io::Result<()> {
    file.flush().await?;
    file.sync_all().await
}

fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty() || filename.len() > MAX_FILENAME_LEN {
        return Err(RelayError::MalformedMessage(format!(
            "filename must be 1 to {} bytes",
            MAX_FILENAME_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: usize = 32 * 1024;

    fn coordinator(dir: &tempfile::TempDir) -> FileTransferCoordinator {
        FileTransferCoordinator::new(dir.path().to_path_buf(), 500 * 1024 * 1024, CHUNK)
    }

    fn dir_entries(dir: &tempfile::TempDir) -> usize {
        std::fs::read_dir(dir.path()).unwrap().count()
    }

    async fn upload_bytes(files: &FileTransferCoordinator, session: &str, name: &str, data: &[u8]) {
        let owner = Uuid::new_v4();
        let mut upload = files
            .begin_upload(session, name, data.len() as u64, owner, "alice")
            .await
            .unwrap();
        for chunk in data.chunks(CHUNK) {
            files.write_chunk(&mut upload, chunk).await.unwrap();
        }
        let finished = files.complete_upload(upload).await.unwrap();
        files.publish(finished).await;
    }

    #[tokio::test]
    async fn test_sealed_upload_listed_only_once_published() {
        let dir = tempfile::tempdir().unwrap();
        let files = coordinator(&dir);
        let mut upload = files
            .begin_upload("S", "a.txt", 5, Uuid::new_v4(), "alice")
            .await
            .unwrap();
        files.write_chunk(&mut upload, b"hello").await.unwrap();

        let finished = files.complete_upload(upload).await.unwrap();
        assert_eq!(files.in_flight_count().await, 0);
        assert!(files.inventory("S").await.is_empty());
        assert!(files.begin_download("S", "a.txt").await.is_err());

        let entry = files.publish(finished).await;
        assert_eq!(entry.size, 5);
        assert_eq!(files.inventory("S").await, vec![entry]);
    }

    #[tokio::test]
    async fn test_interrupted_upload_is_never_visible() {
        let dir = tempfile::tempdir().unwrap();
        let files = coordinator(&dir);
        files.prepare().await.unwrap();
        let alice = Uuid::new_v4();

        let mut upload = files
            .begin_upload("S", "doc.pdf", 100_000, alice, "alice")
            .await
            .unwrap();
        files.write_chunk(&mut upload, &[1u8; CHUNK]).await.unwrap();
        files.write_chunk(&mut upload, &[2u8; CHUNK]).await.unwrap();
        assert!(files.inventory("S").await.is_empty());

        // connection drops
        assert_eq!(files.discard_owner(alice).await, 1);
        drop(upload);

        assert!(files.inventory("S").await.is_empty());
        assert!(matches!(
            files.begin_download("S", "doc.pdf").await,
            Err(RelayError::FileNotFound(_))
        ));
        assert_eq!(files.in_flight_count().await, 0);
        assert_eq!(dir_entries(&dir), 0);
    }

    #[tokio::test]
    async fn test_complete_after_discard_fails() {
        let dir = tempfile::tempdir().unwrap();
        let files = coordinator(&dir);
        let alice = Uuid::new_v4();

        let mut upload = files.begin_upload("S", "a.txt", 4, alice, "alice").await.unwrap();
        files.write_chunk(&mut upload, b"abcd").await.unwrap();
        files.discard_owner(alice).await;

        assert!(matches!(
            files.complete_upload(upload).await,
            Err(RelayError::UploadIncomplete { .. })
        ));
        assert!(files.inventory("S").await.is_empty());
        assert_eq!(dir_entries(&dir), 0);
    }

    #[tokio::test]
    async fn test_overrun_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let files = coordinator(&dir);
        let mut upload = files
            .begin_upload("S", "a.txt", 4, Uuid::new_v4(), "alice")
            .await
            .unwrap();
        files.write_chunk(&mut upload, b"abc").await.unwrap();

        let err = files.write_chunk(&mut upload, b"de").await.unwrap_err();
        assert!(matches!(err, RelayError::FileOverrun { declared: 4, .. }));
        assert_eq!(upload.received, 3);
    }

    #[tokio::test]
    async fn test_short_upload_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let files = coordinator(&dir);
        let mut upload = files
            .begin_upload("S", "a.txt", 10, Uuid::new_v4(), "alice")
            .await
            .unwrap();
        files.write_chunk(&mut upload, b"abc").await.unwrap();

        let err = files.complete_upload(upload).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::UploadIncomplete {
                received: 3,
                declared: 10,
                ..
            }
        ));
        assert!(files.inventory("S").await.is_empty());
        assert_eq!(files.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn test_too_large_rejected_before_storage() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileTransferCoordinator::new(dir.path().to_path_buf(), 1000, CHUNK);
        let err = files
            .begin_upload("S", "big.iso", 1001, Uuid::new_v4(), "alice")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::FileTooLarge { size: 1001, limit: 1000 }));
        assert_eq!(dir_entries(&dir), 0);
    }

    #[tokio::test]
    async fn test_same_name_upload_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let files = coordinator(&dir);
        let _first = files
            .begin_upload("S", "a.txt", 4, Uuid::new_v4(), "alice")
            .await
            .unwrap();
        let err = files
            .begin_upload("S", "a.txt", 4, Uuid::new_v4(), "bob")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::UploadInProgress(_)));

        // another session may use the name
        files
            .begin_upload("T", "a.txt", 4, Uuid::new_v4(), "bob")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_downloads_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let files = coordinator(&dir);
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        upload_bytes(&files, "S", "doc.pdf", &data).await;

        let inventory = files.inventory("S").await;
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].size, 100_000);
        assert_eq!(inventory[0].sender, "alice");

        let mut first = files.begin_download("S", "doc.pdf").await.unwrap();
        let mut second = files.begin_download("S", "doc.pdf").await.unwrap();

        // interleave the two readers
        let (offset, chunk) = first.next_chunk().await.unwrap().unwrap();
        assert_eq!((offset, chunk.len()), (0, CHUNK));

        let mut collected = Vec::new();
        let mut offsets = Vec::new();
        while let Some((offset, chunk)) = second.next_chunk().await.unwrap() {
            offsets.push(offset);
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, data);
        assert_eq!(offsets, vec![0, 32_768, 65_536, 98_304]);

        let mut rest = chunk.to_vec();
        while let Some((_, chunk)) = first.next_chunk().await.unwrap() {
            rest.extend_from_slice(&chunk);
        }
        assert_eq!(rest, data);
    }

    #[tokio::test]
    async fn test_dropping_session_deletes_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = coordinator(&dir);
        upload_bytes(&files, "S", "a.txt", b"hello").await;
        upload_bytes(&files, "T", "b.txt", b"world").await;
        assert_eq!(dir_entries(&dir), 2);

        files.drop_session("S").await;
        assert!(files.inventory("S").await.is_empty());
        assert_eq!(files.inventory("T").await.len(), 1);
        assert_eq!(dir_entries(&dir), 1);
    }

    #[tokio::test]
    async fn test_reupload_replaces_stored_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = coordinator(&dir);
        upload_bytes(&files, "S", "a.txt", b"first").await;
        upload_bytes(&files, "S", "a.txt", b"second!").await;

        let inventory = files.inventory("S").await;
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].size, 7);
        assert_eq!(dir_entries(&dir), 1);
    }

    #[tokio::test]
    async fn test_prepare_clears_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.part"), b"x").unwrap();
        std::fs::write(dir.path().join("old.bin"), b"y").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"keep").unwrap();

        coordinator(&dir).prepare().await.unwrap();
        assert_eq!(dir_entries(&dir), 1);
        assert!(dir.path().join("notes.txt").exists());
    }
}
