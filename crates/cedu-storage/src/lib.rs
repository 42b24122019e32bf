//! Catalog persistence: one database-handle abstraction shared by the
//! transactional and plain-connection paths, plus file utilities for
//! snapshot checksums and audit output.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use cedu_core::{CatalogRow, ExamQuestion, PracticeExam, QuestionBank, Table, Unit};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryCatalog, MemoryHandle, MemoryTables};
pub use postgres::{PgCatalog, PgHandle};

pub const CRATE_NAME: &str = "cedu-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{table} row {id} references missing {parent_table} row {parent_id}")]
    ForeignKey {
        table: Table,
        id: String,
        parent_table: Table,
        parent_id: String,
    },
    #[error("{table} row {id} is still referenced by {child_table} rows")]
    StillReferenced {
        table: Table,
        id: String,
        child_table: Table,
    },
    #[error("injected failure on upsert #{nth} into {table}")]
    InjectedFailure { table: Table, nth: usize },
}

/// Whether an upsert created a row or fully replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Upserted {
    Inserted,
    Updated,
}

/// Select/insert/update/delete capability over the catalog tables.
///
/// Implemented once per backend for both a transaction-scoped handle and a
/// plain connection, so importers never need two code paths.
#[async_trait]
pub trait CatalogDb: Send {
    /// Take the cross-process "import in progress" lock for the lifetime of
    /// the surrounding transaction. Returns `false` when another run holds it.
    async fn try_lock_import(&mut self) -> Result<bool, StoreError>;

    /// Insert the row, or overwrite every column of the row with the same id.
    async fn upsert(&mut self, row: &CatalogRow) -> Result<Upserted, StoreError>;

    /// Ids of rows whose parent column is one of `parent_ids`.
    async fn ids_with_parent(
        &mut self,
        table: Table,
        parent_ids: &[String],
    ) -> Result<Vec<String>, StoreError>;

    async fn delete_ids(&mut self, table: Table, ids: &[String]) -> Result<u64, StoreError>;

    /// Delete every row whose parent column is one of `parent_ids`.
    async fn delete_children(
        &mut self,
        table: Table,
        parent_ids: &[String],
    ) -> Result<u64, StoreError>;

    async fn count(&mut self, table: Table) -> Result<u64, StoreError>;

    async fn units(&mut self) -> Result<Vec<Unit>, StoreError>;

    async fn question_banks(&mut self) -> Result<Vec<QuestionBank>, StoreError>;

    async fn practice_exams(&mut self) -> Result<Vec<PracticeExam>, StoreError>;

    /// Questions of one exam in `sequence` order.
    async fn exam_questions(&mut self, exam_id: &str) -> Result<Vec<ExamQuestion>, StoreError>;

    /// Number of bank questions per bank id; banks without questions are absent.
    async fn bank_question_counts(&mut self) -> Result<HashMap<String, u64>, StoreError>;
}

/// Opens the transaction that scopes one import run, and plain connections
/// for reads that must happen outside it.
#[async_trait]
pub trait TransactionProvider: Send + Sync {
    type Tx: CatalogDb + Send + 'static;
    type Conn: CatalogDb + Send + 'static;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError>;

    async fn connect(&self) -> Result<Self::Conn, StoreError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Serialize `value` as pretty JSON and move it into place with a temp-file rename,
/// so a crashed run never leaves a truncated file behind.
pub async fn write_json_atomically<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<PathBuf> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn checksum_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_json_write_creates_parent_and_replaces() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("import-x.json");

        write_json_atomically(&path, &serde_json::json!({"success": false}))
            .await
            .expect("first write");
        write_json_atomically(&path, &serde_json::json!({"success": true}))
            .await
            .expect("second write");

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value["success"], true);
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
