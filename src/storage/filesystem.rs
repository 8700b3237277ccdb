use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use dimse::provider::{FindProvider, InstanceMetadata, InstanceRef, Matches, Query, RetrieveProvider, StorageSink};
use dimse::{status, transcode};
use tracing::{debug, info, warn};

use crate::storage::query::{self, extract_keys};
use crate::storage::{InstanceRecord, StorageError, StorageResult};

/// Filesystem-backed instance store
///
/// Every data set is kept as `<root>/<SOP Instance UID>.dcm`, encoded in the
/// transfer syntax it arrived in, next to a `.json` sidecar holding its
/// metadata and matching keys. Both files are written to a temporary name
/// first and renamed into place; the sidecar is renamed last, so an instance
/// only becomes visible to queries once it is complete.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root_path: PathBuf,
}

impl FilesystemStorage {
    /// Create a new filesystem store rooted at `root_path`
    pub fn new<P: AsRef<Path>>(root_path: P) -> StorageResult<Self> {
        let root_path = root_path.as_ref().to_path_buf();

        if !root_path.exists() {
            std::fs::create_dir_all(&root_path).map_err(|e| {
                StorageError::Config(format!(
                    "Failed to create storage root directory '{}': {}",
                    root_path.display(),
                    e
                ))
            })?;
        }
        if !root_path.is_dir() {
            return Err(StorageError::Config(format!(
                "Storage root '{}' is not a directory",
                root_path.display()
            )));
        }

        Ok(Self { root_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.root_path
    }

    /// Path of the data set file for `sop_instance_uid`
    pub fn instance_path(&self, sop_instance_uid: &str) -> StorageResult<PathBuf> {
        Ok(self.root_path.join(format!("{}.dcm", checked_uid(sop_instance_uid)?)))
    }

    fn sidecar_path(&self, sop_instance_uid: &str) -> StorageResult<PathBuf> {
        Ok(self.root_path.join(format!("{}.json", checked_uid(sop_instance_uid)?)))
    }

    /// Writes a data set and its sidecar.
    pub async fn put(&self, record: InstanceRecord, data: Bytes) -> StorageResult<PathBuf> {
        let instance_path = self.instance_path(&record.sop_instance_uid)?;
        let sidecar_path = self.sidecar_path(&record.sop_instance_uid)?;
        let root = self.root_path.clone();
        let sidecar = serde_json::to_vec_pretty(&record)?;

        let target = instance_path.clone();
        tokio::task::spawn_blocking(move || -> StorageResult<()> {
            write_atomic(&root, &target, &data)?;
            write_atomic(&root, &sidecar_path, &sidecar)?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;

        Ok(instance_path)
    }

    /// Reads the data set bytes of a stored instance.
    pub async fn read(&self, sop_instance_uid: &str) -> StorageResult<Vec<u8>> {
        let path = self.instance_path(sop_instance_uid)?;
        Ok(tokio::fs::read(&path).await?)
    }

    /// Sidecars of every complete instance. Unreadable sidecars are skipped.
    pub async fn records(&self) -> StorageResult<Vec<InstanceRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(StorageError::from)
                .and_then(|bytes| serde_json::from_slice::<InstanceRecord>(&bytes).map_err(StorageError::from));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), "skipping sidecar: {}", e),
            }
        }
        records.sort_by(|a, b| {
            (a.received_at, &a.sop_instance_uid).cmp(&(b.received_at, &b.sop_instance_uid))
        });
        Ok(records)
    }
}

/// SOP Instance UIDs become file names; only UID characters are allowed.
fn checked_uid(uid: &str) -> StorageResult<&str> {
    let valid = !uid.is_empty()
        && uid.len() <= 64
        && uid.chars().all(|c| c.is_ascii_digit() || c == '.')
        && !uid.starts_with('.');
    if valid {
        Ok(uid)
    } else {
        Err(StorageError::Path(format!("'{}' is not a valid SOP Instance UID", uid)))
    }
}

fn write_atomic(dir: &Path, target: &Path, contents: &[u8]) -> StorageResult<()> {
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(target).map_err(|e| StorageError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl StorageSink for FilesystemStorage {
    async fn store(&self, metadata: &InstanceMetadata, data: Bytes) -> dimse::Result<u16> {
        let mut keys = match transcode::read_data_set(&data, &metadata.transfer_syntax) {
            Ok(object) => extract_keys(&object),
            Err(e) => {
                warn!(sop_instance_uid = %metadata.sop_instance_uid, "storing without matching keys: {}", e);
                Default::default()
            }
        };
        keys.entry("SOPInstanceUID".to_string())
            .or_insert_with(|| metadata.sop_instance_uid.clone());
        keys.entry("SOPClassUID".to_string())
            .or_insert_with(|| metadata.sop_class_uid.clone());

        let record = InstanceRecord {
            sop_class_uid: metadata.sop_class_uid.clone(),
            sop_instance_uid: metadata.sop_instance_uid.clone(),
            transfer_syntax: metadata.transfer_syntax.clone(),
            calling_ae_title: metadata.calling_ae_title.clone(),
            received_at: metadata.received_at,
            size_bytes: metadata.size_bytes,
            keys,
        };
        let path = self.put(record, data).await?;
        info!(
            sop_instance_uid = %metadata.sop_instance_uid,
            path = %path.display(),
            "instance stored"
        );
        Ok(status::SUCCESS)
    }
}

#[async_trait]
impl FindProvider for FilesystemStorage {
    async fn find(&self, query: &Query) -> dimse::Result<Matches> {
        let records = self.records().await?;
        let responses: Vec<_> = query::select(&records, &query.identifier, true)
            .into_iter()
            .map(|record| query::response(&query.identifier, record))
            .collect();
        debug!(
            calling = %query.calling_ae_title,
            matches = responses.len(),
            "C-FIND evaluated"
        );
        Ok(Box::new(responses.into_iter().map(Ok)))
    }
}

#[async_trait]
impl RetrieveProvider for FilesystemStorage {
    async fn retrieve(&self, query: &Query) -> dimse::Result<Vec<InstanceRef>> {
        let records = self.records().await?;
        Ok(query::select(&records, &query.identifier, false)
            .into_iter()
            .map(|record| InstanceRef {
                sop_class_uid: record.sop_class_uid.clone(),
                sop_instance_uid: record.sop_instance_uid.clone(),
                transfer_syntax: record.transfer_syntax.clone(),
            })
            .collect())
    }

    async fn load(&self, instance: &InstanceRef) -> dimse::Result<Bytes> {
        Ok(Bytes::from(self.read(&instance.sop_instance_uid).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(uid: &str, study: &str) -> InstanceRecord {
        InstanceRecord {
            sop_class_uid: dimse::uids::SECONDARY_CAPTURE_IMAGE_STORAGE.to_string(),
            sop_instance_uid: uid.to_string(),
            transfer_syntax: dimse::uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
            calling_ae_title: "MODALITY".to_string(),
            received_at: chrono::Utc::now(),
            size_bytes: 4,
            keys: [("StudyInstanceUID".to_string(), study.to_string())].into_iter().collect(),
        }
    }

    #[test]
    fn test_filesystem_storage_creation() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let nested = temp_dir.path().join("archive/instances");
        let storage = FilesystemStorage::new(&nested).expect("Failed to create storage");
        assert!(storage.base_path().is_dir());
    }

    #[test]
    fn test_root_must_be_a_directory() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(FilesystemStorage::new(&file), Err(StorageError::Config(_))));
    }

    #[test]
    fn test_uid_checked_before_use_as_path() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FilesystemStorage::new(temp_dir.path()).unwrap();
        assert!(storage.instance_path("1.2.3.4").unwrap().ends_with("1.2.3.4.dcm"));
        assert!(matches!(storage.instance_path("../etc/passwd"), Err(StorageError::Path(_))));
        assert!(matches!(storage.instance_path(""), Err(StorageError::Path(_))));
    }

    #[tokio::test]
    async fn test_put_read_and_list() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FilesystemStorage::new(temp_dir.path()).unwrap();

        storage.put(record("1.2.3.1", "9.1"), Bytes::from_static(b"abcd")).await.unwrap();
        storage.put(record("1.2.3.2", "9.1"), Bytes::from_static(b"efgh")).await.unwrap();

        assert_eq!(storage.read("1.2.3.2").await.unwrap(), b"efgh");
        let records = storage.records().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sop_instance_uid, "1.2.3.1");

        // Overwriting keeps a single copy.
        storage.put(record("1.2.3.1", "9.2"), Bytes::from_static(b"ijkl")).await.unwrap();
        assert_eq!(storage.records().await.unwrap().len(), 2);
        assert_eq!(storage.read("1.2.3.1").await.unwrap(), b"ijkl");
    }

    #[tokio::test]
    async fn test_broken_sidecar_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FilesystemStorage::new(temp_dir.path()).unwrap();
        storage.put(record("1.2.3.1", "9.1"), Bytes::from_static(b"abcd")).await.unwrap();
        std::fs::write(temp_dir.path().join("1.2.3.9.json"), b"{not json").unwrap();

        assert_eq!(storage.records().await.unwrap().len(), 1);
    }
}
