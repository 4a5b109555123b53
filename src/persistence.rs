/// Persistence layer for the coordination store.
///
/// This module writes the store's live entries to a single snapshot file and
/// restores them after a restart. Expired entries are never written, and
/// entries that expire while the file sits on disk are dropped on load.
///
/// # File Format
///
/// The file is a bincode-encoded envelope containing:
/// - A format version
/// - A CRC32 checksum of the payload
/// - The payload: every live entry with its version, TTL and ACL
///
/// # Usage
///
/// ```ignore
/// // Save store to disk
/// persistence::save(&store, &path).await?;
///
/// // Load into a fresh store
/// let loaded = persistence::load(&path, &store).await?;
/// ```
use crate::error::{SwarmError, SwarmResult};
use crate::storage::MemoryStore;
use crate::types::MemoryEntry;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// On-disk envelope.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    /// Format version for future compatibility
    version: u32,
    /// CRC32 of `payload`
    checksum: u32,
    /// bincode-encoded `Vec<MemoryEntry>`
    payload: Vec<u8>,
}

const SNAPSHOT_VERSION: u32 = 1;

/// Save the store's live entries to disk.
///
/// The file is written to a temporary sibling first and then renamed over
/// `path`, so a crash mid-write leaves the previous snapshot intact.
///
/// Returns the number of entries written.
///
/// # Errors
///
/// Returns `SwarmError::Storage` if:
/// - The parent directory cannot be created
/// - Encoding fails
/// - The write or the atomic rename fails
pub async fn save(store: &MemoryStore, path: &Path) -> SwarmResult<usize> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SwarmError::Storage(format!("Failed to create directory: {}", e)))?;
        }
    }

    let entries = store.snapshot_entries();
    let count = entries.len();
    let payload = bincode::serialize(&entries)?;
    let file = SnapshotFile {
        version: SNAPSHOT_VERSION,
        checksum: crc32fast::hash(&payload),
        payload,
    };
    let bytes = bincode::serialize(&file)?;

    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, &bytes)
        .await
        .map_err(|e| SwarmError::Storage(format!("Failed to write temporary file: {}", e)))?;
    fs::rename(&temp_path, path)
        .await
        .map_err(|e| SwarmError::Storage(format!("Failed to rename file: {}", e)))?;

    tracing::debug!(path = %path.display(), entries = count, "Snapshot saved");
    Ok(count)
}

/// Read and verify a snapshot file without touching any store.
///
/// # Errors
///
/// Returns `SwarmError::Storage` if the file cannot be read, fails its
/// checksum, or was written by an incompatible version.
pub async fn read_entries(path: &Path) -> SwarmResult<Vec<MemoryEntry>> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| SwarmError::Storage(format!("Failed to read snapshot file: {}", e)))?;

    let file: SnapshotFile = bincode::deserialize(&bytes)?;
    if file.version != SNAPSHOT_VERSION {
        return Err(SwarmError::Storage(format!(
            "Incompatible snapshot version: {} (expected {})",
            file.version, SNAPSHOT_VERSION
        )));
    }
    let actual = crc32fast::hash(&file.payload);
    if actual != file.checksum {
        return Err(SwarmError::Storage(format!(
            "Snapshot checksum mismatch: stored {:08x}, computed {:08x}",
            file.checksum, actual
        )));
    }
    Ok(bincode::deserialize(&file.payload)?)
}

/// Load a snapshot into `store`, returning the number of entries loaded.
pub async fn load(path: &Path, store: &MemoryStore) -> SwarmResult<usize> {
    let entries = read_entries(path).await?;
    Ok(store.restore_entries(entries))
}

/// Check if a snapshot file exists at the given path.
pub async fn exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Acl, OpContext, StoreOptions};
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_and_load() {
        let store = MemoryStore::standalone();
        let ctx = OpContext::new("alice");
        store
            .store(&ctx, "fleet/patterns", "p1", b"one".to_vec(), StoreOptions::new())
            .unwrap();
        store
            .store(&ctx, "fleet/patterns", "p1", b"two".to_vec(), StoreOptions::new())
            .unwrap();
        store
            .store(
                &ctx,
                "fleet/learning/alice",
                "state",
                b"{}".to_vec(),
                StoreOptions::new().with_acl(Acl::private("alice")),
            )
            .unwrap();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("fleet.snapshot");
        assert_eq!(save(&store, &path).await.unwrap(), 2);

        let loaded = MemoryStore::standalone();
        assert_eq!(load(&path, &loaded).await.unwrap(), 2);

        let p1 = loaded.retrieve(&ctx, "fleet/patterns", "p1").unwrap();
        assert_eq!(p1.value, b"two");
        assert_eq!(p1.version, 2);

        let state = loaded
            .retrieve(&ctx, "fleet/learning/alice", "state")
            .unwrap();
        assert_eq!(state.acl, Acl::private("alice"));
        assert!(loaded
            .retrieve(&OpContext::new("bob"), "fleet/learning/alice", "state")
            .is_err());
    }

    #[tokio::test]
    async fn test_save_skips_expired() {
        let store = MemoryStore::standalone();
        let ctx = OpContext::new("alice");
        store
            .store(
                &ctx,
                "p",
                "short",
                vec![1],
                StoreOptions::new().with_ttl(Duration::from_millis(1)),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.snapshot");
        assert_eq!(save(&store, &path).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupted_file_rejected() {
        let store = MemoryStore::standalone();
        store
            .store(&OpContext::new("a"), "p", "k", b"value".to_vec(), StoreOptions::new())
            .unwrap();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.snapshot");
        save(&store, &path).await.unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let result = read_entries(&path).await;
        assert!(matches!(result, Err(SwarmError::Storage(_))));
    }

    #[tokio::test]
    async fn test_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.snapshot");
        assert!(!exists(&path).await);
        save(&MemoryStore::standalone(), &path).await.unwrap();
        assert!(exists(&path).await);
    }

    #[tokio::test]
    async fn test_load_nonexistent_file() {
        let result = load(Path::new("/nonexistent/file.snapshot"), &MemoryStore::standalone()).await;
        assert!(matches!(result, Err(SwarmError::Storage(_))));
    }
}
