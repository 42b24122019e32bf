//! Post-commit recount of every catalog table.

use std::collections::BTreeMap;

use cedu_core::Table;
use cedu_storage::{CatalogDb, StoreError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCount {
    pub expected: usize,
    pub imported: usize,
    pub verified: usize,
}

impl EntityCount {
    pub fn is_short(&self) -> bool {
        self.verified < self.expected
    }
}

/// Seed per-table counts with the snapshot's expected lengths.
pub fn initial_counts(expected: &[(Table, usize)]) -> BTreeMap<Table, EntityCount> {
    expected
        .iter()
        .map(|&(table, expected)| {
            (
                table,
                EntityCount {
                    expected,
                    ..EntityCount::default()
                },
            )
        })
        .collect()
}

/// Fill `verified` from a fresh read and return the tables that came up short.
///
/// `db` must be a handle outside the import transaction.
pub async fn verify_counts(
    db: &mut dyn CatalogDb,
    counts: &mut BTreeMap<Table, EntityCount>,
) -> Result<Vec<Table>, StoreError> {
    let mut short = Vec::new();
    for table in Table::ALL {
        let verified = db.count(table).await?;
        let entry = counts.entry(table).or_default();
        entry.verified = usize::try_from(verified).unwrap_or(usize::MAX);
        if entry.is_short() {
            short.push(table);
        }
    }
    Ok(short)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cedu_core::{CatalogRow, Course, ExtraFields};
    use cedu_storage::{MemoryCatalog, TransactionProvider};

    fn course(id: &str) -> CatalogRow {
        CatalogRow::Course(Course {
            id: id.into(),
            title: id.into(),
            description: None,
            state: None,
            product_type: None,
            hours_required: None,
            price: None,
            sku: None,
            created_at: None,
            updated_at: None,
            extra: ExtraFields::new(),
        })
    }

    #[tokio::test]
    async fn fewer_rows_than_expected_is_a_shortfall() {
        let catalog = MemoryCatalog::new();
        catalog.seed([course("c1"), course("c2")]).await;
        let mut counts = initial_counts(&[(Table::Courses, 3), (Table::Units, 0)]);

        let mut conn = catalog.connect().await.unwrap();
        let short = verify_counts(&mut conn, &mut counts).await.unwrap();

        assert_eq!(short, vec![Table::Courses]);
        assert_eq!(counts[&Table::Courses].verified, 2);
        assert_eq!(counts.len(), Table::ALL.len());
    }

    #[tokio::test]
    async fn extra_rows_are_not_a_shortfall() {
        let catalog = MemoryCatalog::new();
        catalog.seed([course("c1"), course("c2")]).await;
        let mut counts = initial_counts(&[(Table::Courses, 1)]);
        let mut conn = catalog.connect().await.unwrap();
        assert!(verify_counts(&mut conn, &mut counts).await.unwrap().is_empty());
    }
}
