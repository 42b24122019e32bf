//! Upsert-by-id importers and scoped stale cleanup, run in foreign-key order.

use std::collections::{BTreeMap, HashSet};

use cedu_core::{CatalogRecord, CatalogSnapshot, Table};
use cedu_storage::{CatalogDb, StoreError, Upserted};

use crate::audit::{AuditLog, Stage};

/// Upsert every record; returns how many rows were written.
pub async fn import_entities<R: CatalogRecord>(
    db: &mut dyn CatalogDb,
    records: &[R],
    audit: &mut AuditLog,
) -> Result<usize, StoreError> {
    let mut inserted = 0usize;
    let mut updated = 0usize;
    for record in records {
        match db.upsert(&record.to_row()).await? {
            Upserted::Inserted => inserted += 1,
            Upserted::Updated => updated += 1,
        }
    }
    audit.info_with(
        Stage::Import,
        format!("{}: {} inserted, {} updated", R::TABLE, inserted, updated),
        serde_json::json!({ "table": R::TABLE, "inserted": inserted, "updated": updated }),
    );
    Ok(inserted + updated)
}

fn cascade_child(table: Table) -> Option<Table> {
    match table {
        Table::Units => Some(Table::Lessons),
        Table::QuestionBanks => Some(Table::BankQuestions),
        Table::PracticeExams => Some(Table::ExamQuestions),
        _ => None,
    }
}

/// Delete rows of `table` whose parent is covered by the snapshot but whose
/// id is absent from it. Rows under parents the snapshot does not mention are
/// never touched. Children of stale rows are removed first.
pub async fn cleanup_stale(
    db: &mut dyn CatalogDb,
    table: Table,
    snapshot_ids: &HashSet<String>,
    snapshot_parent_ids: &[String],
    audit: &mut AuditLog,
) -> Result<Vec<String>, StoreError> {
    let existing = db.ids_with_parent(table, snapshot_parent_ids).await?;
    let mut stale: Vec<String> = existing
        .into_iter()
        .filter(|id| !snapshot_ids.contains(id))
        .collect();
    if stale.is_empty() {
        return Ok(stale);
    }
    stale.sort();

    let mut cascaded = 0;
    if let Some(child) = cascade_child(table) {
        cascaded = db.delete_children(child, &stale).await?;
    }
    let deleted = db.delete_ids(table, &stale).await?;
    audit.info_with(
        Stage::Cleanup,
        format!("{table}: removed {deleted} stale row(s)"),
        serde_json::json!({
            "table": table,
            "ids": stale,
            "cascadedChildren": cascaded,
        }),
    );
    Ok(stale)
}

fn ids_of<R: CatalogRecord>(records: &[R]) -> Vec<String> {
    records.iter().map(CatalogRecord::id).collect()
}

fn id_set<R: CatalogRecord>(records: &[R]) -> HashSet<String> {
    records.iter().map(CatalogRecord::id).collect()
}

/// Write the whole snapshot. Each step finishes before the next starts since
/// later steps rely on rows written earlier in the same transaction.
pub async fn import_snapshot(
    db: &mut dyn CatalogDb,
    snapshot: &CatalogSnapshot,
    audit: &mut AuditLog,
) -> Result<BTreeMap<Table, usize>, StoreError> {
    let course_ids = ids_of(snapshot.courses());
    let unit_ids = ids_of(snapshot.units());
    let mut imported = BTreeMap::new();

    imported.insert(
        Table::Courses,
        import_entities(db, snapshot.courses(), audit).await?,
    );

    cleanup_stale(db, Table::Units, &id_set(snapshot.units()), &course_ids, audit).await?;
    imported.insert(Table::Units, import_entities(db, snapshot.units(), audit).await?);

    cleanup_stale(db, Table::Lessons, &id_set(snapshot.lessons()), &unit_ids, audit).await?;
    imported.insert(
        Table::Lessons,
        import_entities(db, snapshot.lessons(), audit).await?,
    );

    cleanup_stale(
        db,
        Table::QuestionBanks,
        &id_set(snapshot.question_banks()),
        &course_ids,
        audit,
    )
    .await?;
    imported.insert(
        Table::QuestionBanks,
        import_entities(db, snapshot.question_banks(), audit).await?,
    );
    imported.insert(
        Table::BankQuestions,
        import_entities(db, snapshot.bank_questions(), audit).await?,
    );

    cleanup_stale(
        db,
        Table::PracticeExams,
        &id_set(snapshot.practice_exams()),
        &course_ids,
        audit,
    )
    .await?;
    imported.insert(
        Table::PracticeExams,
        import_entities(db, snapshot.practice_exams(), audit).await?,
    );
    imported.insert(
        Table::ExamQuestions,
        import_entities(db, snapshot.exam_questions(), audit).await?,
    );

    imported.insert(
        Table::Bundles,
        import_entities(db, snapshot.bundles(), audit).await?,
    );
    imported.insert(
        Table::BundleCourses,
        import_entities(db, snapshot.bundle_courses(), audit).await?,
    );

    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cedu_core::{CatalogRow, Course, ExtraFields, Lesson, Unit};
    use cedu_storage::{MemoryCatalog, TransactionProvider};

    fn course(id: &str) -> Course {
        Course {
            id: id.into(),
            title: format!("Course {id}"),
            description: None,
            state: Some("FL".into()),
            product_type: Some("real_estate".into()),
            hours_required: Some(14.0),
            price: Some(79.0),
            sku: None,
            created_at: None,
            updated_at: None,
            extra: ExtraFields::new(),
        }
    }

    fn unit(id: &str, course_id: &str, title: &str) -> Unit {
        Unit {
            id: id.into(),
            course_id: course_id.into(),
            unit_number: 1,
            title: title.into(),
            description: None,
            hours_required: None,
            created_at: None,
            updated_at: None,
            extra: ExtraFields::new(),
        }
    }

    fn lesson(id: &str, unit_id: &str) -> Lesson {
        Lesson {
            id: id.into(),
            unit_id: unit_id.into(),
            lesson_number: 1,
            title: "Lesson".into(),
            content: Some("body".into()),
            duration_minutes: None,
            created_at: None,
            updated_at: None,
            extra: ExtraFields::new(),
        }
    }

    #[tokio::test]
    async fn stale_cleanup_is_scoped_to_snapshot_parents() {
        let catalog = MemoryCatalog::new();
        catalog
            .seed([
                CatalogRow::Course(course("A")),
                CatalogRow::Course(course("B")),
                CatalogRow::Unit(unit("U1", "A", "old")),
                CatalogRow::Unit(unit("U2", "A", "old")),
                CatalogRow::Unit(unit("U3", "A", "old")),
                CatalogRow::Unit(unit("U4", "B", "old")),
                CatalogRow::Lesson(lesson("L3", "U3")),
            ])
            .await;

        let mut tx = catalog.begin().await.unwrap();
        let mut audit = AuditLog::new();
        let snapshot_units = [unit("U1", "A", "new"), unit("U2", "A", "new")];
        let stale = cleanup_stale(
            &mut tx,
            Table::Units,
            &id_set(&snapshot_units),
            &["A".to_string()],
            &mut audit,
        )
        .await
        .expect("cleanup");
        import_entities(&mut tx, &snapshot_units, &mut audit).await.unwrap();
        catalog.commit(tx).await.unwrap();

        assert_eq!(stale, vec!["U3".to_string()]);
        let tables = catalog.tables().await;
        assert!(tables.get(Table::Units, "U3").is_none());
        assert!(tables.get(Table::Lessons, "L3").is_none());
        assert!(tables.get(Table::Units, "U4").is_some());
        match tables.get(Table::Units, "U1") {
            Some(CatalogRow::Unit(u)) => assert_eq!(u.title, "new"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn nothing_is_deleted_without_covered_parents() {
        let catalog = MemoryCatalog::new();
        catalog
            .seed([
                CatalogRow::Course(course("A")),
                CatalogRow::Unit(unit("U1", "A", "kept")),
            ])
            .await;
        let mut conn = catalog.connect().await.unwrap();
        let mut audit = AuditLog::new();
        let stale = cleanup_stale(&mut conn, Table::Units, &HashSet::new(), &[], &mut audit)
            .await
            .unwrap();
        assert!(stale.is_empty());
        assert_eq!(catalog.tables().await.len(Table::Units), 1);
    }
}
