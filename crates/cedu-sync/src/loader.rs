//! Snapshot discovery and parsing.

use std::path::{Path, PathBuf};

use cedu_core::CatalogSnapshot;
use cedu_storage::sha256_hex;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("no catalog snapshot found; searched: {}", display_paths(.searched))]
    NotFound { searched: Vec<PathBuf> },
    #[error("reading snapshot {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing snapshot {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone)]
pub struct LoadedSnapshot {
    pub path: PathBuf,
    pub checksum: String,
    pub byte_size: usize,
    pub snapshot: CatalogSnapshot,
}

/// Load the first candidate path that is an existing file. Directories are
/// skipped.
///
/// Timestamp fields are decoded into `DateTime<Utc>` by the typed records, so
/// every row reaches validation with native instants.
pub async fn load_snapshot(candidates: &[PathBuf]) -> Result<LoadedSnapshot, SnapshotError> {
    for path in candidates {
        let is_file = fs::metadata(path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !is_file {
            continue;
        }
        return parse_snapshot_file(path).await;
    }
    Err(SnapshotError::NotFound {
        searched: candidates.to_vec(),
    })
}

async fn parse_snapshot_file(path: &Path) -> Result<LoadedSnapshot, SnapshotError> {
    let bytes = fs::read(path).await.map_err(|source| SnapshotError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let snapshot: CatalogSnapshot =
        serde_json::from_slice(&bytes).map_err(|source| SnapshotError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(LoadedSnapshot {
        path: path.to_path_buf(),
        checksum: sha256_hex(&bytes),
        byte_size: bytes.len(),
        snapshot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn first_existing_candidate_wins() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("data").join("catalog-snapshot.json");
        let second = dir.path().join("second.json");
        let third = dir.path().join("third.json");
        std::fs::write(&second, r#"{"version":"2","courses":[]}"#).unwrap();
        std::fs::write(&third, r#"{"version":"3","courses":[]}"#).unwrap();

        let loaded = load_snapshot(&[missing, second.clone(), third])
            .await
            .expect("load");
        assert_eq!(loaded.path, second);
        assert_eq!(loaded.snapshot.version, "2");
        assert_eq!(loaded.checksum.len(), 64);
    }

    #[tokio::test]
    async fn directory_candidates_are_skipped() {
        let dir = tempdir().expect("tempdir");
        let as_dir = dir.path().join("catalog-snapshot.json");
        std::fs::create_dir(&as_dir).unwrap();
        let file = dir.path().join("fallback.json");
        std::fs::write(&file, r#"{"version":"4","courses":[]}"#).unwrap();

        let loaded = load_snapshot(&[as_dir.clone(), file.clone()])
            .await
            .expect("load");
        assert_eq!(loaded.path, file);

        let err = load_snapshot(&[as_dir]).await.unwrap_err();
        assert!(matches!(err, SnapshotError::NotFound { .. }));
    }

    #[tokio::test]
    async fn no_candidates_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let err = load_snapshot(&[dir.path().join("nope.json")])
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::NotFound { ref searched } if searched.len() == 1));
    }

    #[tokio::test]
    async fn timestamps_are_parsed_into_instants() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("snap.json");
        std::fs::write(
            &path,
            r#"{"version":"1","exportedAt":"2025-02-01T08:00:00.000Z",
                "courses":[{"id":"c1","title":"T","createdAt":"2024-06-30T23:59:59+02:00"}]}"#,
        )
        .unwrap();
        let loaded = load_snapshot(&[path]).await.expect("load");
        let created = loaded.snapshot.courses()[0].created_at.expect("createdAt");
        assert_eq!(created.to_rfc3339(), "2024-06-30T21:59:59+00:00");
        assert!(loaded.snapshot.exported_at.is_some());
    }

    #[tokio::test]
    async fn malformed_timestamp_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("snap.json");
        std::fs::write(
            &path,
            r#"{"version":"1","courses":[{"id":"c1","title":"T","createdAt":"yesterday"}]}"#,
        )
        .unwrap();
        let err = load_snapshot(&[path]).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Malformed { .. }));
    }
}
