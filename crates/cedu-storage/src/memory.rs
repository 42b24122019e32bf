//! In-memory catalog for tests and local runs.
//!
//! A transaction is a private copy of the tables that replaces the shared
//! state on commit and is dropped on rollback. Required foreign keys are
//! enforced the same way the Postgres schema enforces them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use cedu_core::{CatalogRow, ExamQuestion, PracticeExam, QuestionBank, Table, Unit};
use tokio::sync::Mutex;

use crate::{CatalogDb, StoreError, TransactionProvider, Upserted};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTables {
    rows: BTreeMap<Table, BTreeMap<String, CatalogRow>>,
}

impl MemoryTables {
    pub fn rows(&self, table: Table) -> impl Iterator<Item = &CatalogRow> {
        self.rows.get(&table).into_iter().flat_map(|m| m.values())
    }

    pub fn get(&self, table: Table, id: &str) -> Option<&CatalogRow> {
        self.rows.get(&table).and_then(|m| m.get(id))
    }

    pub fn len(&self, table: Table) -> usize {
        self.rows.get(&table).map(BTreeMap::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.values().all(BTreeMap::is_empty)
    }

    pub fn counts(&self) -> BTreeMap<Table, usize> {
        Table::ALL.into_iter().map(|t| (t, self.len(t))).collect()
    }

    /// Write a row without foreign-key checks; for seeding test fixtures.
    pub fn put(&mut self, row: CatalogRow) -> Upserted {
        let previous = self
            .rows
            .entry(row.table())
            .or_default()
            .insert(row.id(), row);
        if previous.is_some() {
            Upserted::Updated
        } else {
            Upserted::Inserted
        }
    }

    pub fn remove(&mut self, table: Table, id: &str) -> Option<CatalogRow> {
        self.rows.get_mut(&table).and_then(|m| m.remove(id))
    }

    fn check_references(&self, row: &CatalogRow) -> Result<(), StoreError> {
        for (parent_table, parent_id) in required_references(row) {
            if self.get(parent_table, parent_id).is_none() {
                return Err(StoreError::ForeignKey {
                    table: row.table(),
                    id: row.id(),
                    parent_table,
                    parent_id: parent_id.to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_unreferenced(&self, table: Table, id: &str) -> Result<(), StoreError> {
        for child_table in Table::ALL {
            let referenced = self.rows(child_table).any(|child| {
                required_references(child)
                    .iter()
                    .any(|(parent_table, parent_id)| *parent_table == table && *parent_id == id)
            });
            if referenced {
                return Err(StoreError::StillReferenced {
                    table,
                    id: id.to_string(),
                    child_table,
                });
            }
        }
        Ok(())
    }
}

/// Foreign keys that must resolve; course references on banks and exams are optional.
fn required_references(row: &CatalogRow) -> Vec<(Table, &str)> {
    match row {
        CatalogRow::Unit(u) => vec![(Table::Courses, u.course_id.as_str())],
        CatalogRow::Lesson(l) => vec![(Table::Units, l.unit_id.as_str())],
        CatalogRow::BankQuestion(q) => vec![(Table::QuestionBanks, q.bank_id.as_str())],
        CatalogRow::ExamQuestion(q) => vec![(Table::PracticeExams, q.exam_id.as_str())],
        CatalogRow::BundleCourse(link) => vec![
            (Table::Bundles, link.bundle_id.as_str()),
            (Table::Courses, link.course_id.as_str()),
        ],
        _ => Vec::new(),
    }
}

type CommitHook = Arc<dyn Fn(&mut MemoryTables) + Send + Sync>;

#[derive(Default)]
struct FaultPlan {
    fail_upsert: Option<(Table, usize)>,
    upsert_delay: Option<Duration>,
    upserts_seen: HashMap<Table, usize>,
}

/// Shared in-memory catalog implementing [`TransactionProvider`].
#[derive(Clone)]
pub struct MemoryCatalog {
    tables: Arc<Mutex<MemoryTables>>,
    faults: Arc<StdMutex<FaultPlan>>,
    import_lock: Arc<AtomicBool>,
    after_commit: Arc<StdMutex<Option<CommitHook>>>,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::with_tables(MemoryTables::default())
    }
}

impl fmt::Debug for MemoryCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCatalog")
            .field("import_locked", &self.import_lock.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tables(tables: MemoryTables) -> Self {
        Self {
            tables: Arc::new(Mutex::new(tables)),
            faults: Arc::new(StdMutex::new(FaultPlan::default())),
            import_lock: Arc::new(AtomicBool::new(false)),
            after_commit: Arc::new(StdMutex::new(None)),
        }
    }

    /// Copy of the committed state.
    pub async fn tables(&self) -> MemoryTables {
        self.tables.lock().await.clone()
    }

    pub async fn seed(&self, rows: impl IntoIterator<Item = CatalogRow>) {
        let mut tables = self.tables.lock().await;
        for row in rows {
            tables.put(row);
        }
    }

    /// Make the `nth` (1-based) upsert into `table` fail, counted across handles.
    pub fn fail_upsert_at(&self, table: Table, nth: usize) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.fail_upsert = Some((table, nth));
            faults.upserts_seen.clear();
        }
    }

    /// Sleep before every upsert, to exercise time budgets.
    pub fn slow_upserts(&self, delay: Duration) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.upsert_delay = Some(delay);
        }
    }

    /// Run `hook` against the committed state right after every commit,
    /// standing in for a concurrent writer.
    pub fn after_commit(&self, hook: impl Fn(&mut MemoryTables) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.after_commit.lock() {
            *slot = Some(Arc::new(hook));
        }
    }

    fn handle(&self, tables: Arc<Mutex<MemoryTables>>) -> MemoryHandle {
        MemoryHandle {
            tables,
            faults: self.faults.clone(),
            import_lock: self.import_lock.clone(),
            holds_lock: false,
        }
    }
}

#[async_trait]
impl TransactionProvider for MemoryCatalog {
    type Tx = MemoryHandle;
    type Conn = MemoryHandle;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let working = self.tables.lock().await.clone();
        Ok(self.handle(Arc::new(Mutex::new(working))))
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        let working = tx.tables.lock().await.clone();
        let hook = self.after_commit.lock().ok().and_then(|slot| slot.clone());
        let mut shared = self.tables.lock().await;
        *shared = working;
        if let Some(hook) = hook {
            hook(&mut shared);
        }
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        drop(tx);
        Ok(())
    }

    async fn connect(&self) -> Result<Self::Conn, StoreError> {
        Ok(self.handle(self.tables.clone()))
    }
}

/// Handle over either a transaction's working copy or the committed tables.
pub struct MemoryHandle {
    tables: Arc<Mutex<MemoryTables>>,
    faults: Arc<StdMutex<FaultPlan>>,
    import_lock: Arc<AtomicBool>,
    holds_lock: bool,
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        if self.holds_lock {
            self.import_lock.store(false, Ordering::SeqCst);
        }
    }
}

impl MemoryHandle {
    fn check_fault(&self, table: Table) -> Result<(), StoreError> {
        let Ok(mut faults) = self.faults.lock() else {
            return Ok(());
        };
        let seen = {
            let counter = faults.upserts_seen.entry(table).or_default();
            *counter += 1;
            *counter
        };
        match faults.fail_upsert {
            Some((fail_table, nth)) if fail_table == table && nth == seen => {
                Err(StoreError::InjectedFailure { table, nth })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl CatalogDb for MemoryHandle {
    async fn try_lock_import(&mut self) -> Result<bool, StoreError> {
        if self.holds_lock {
            return Ok(true);
        }
        let acquired = self
            .import_lock
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        self.holds_lock = acquired;
        Ok(acquired)
    }

    async fn upsert(&mut self, row: &CatalogRow) -> Result<Upserted, StoreError> {
        let delay = self.faults.lock().ok().and_then(|faults| faults.upsert_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_fault(row.table())?;
        let mut tables = self.tables.lock().await;
        tables.check_references(row)?;
        Ok(tables.put(row.clone()))
    }

    async fn ids_with_parent(
        &mut self,
        table: Table,
        parent_ids: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .rows(table)
            .filter(|row| {
                row.parent_id()
                    .is_some_and(|parent| parent_ids.iter().any(|p| p == parent))
            })
            .map(CatalogRow::id)
            .collect())
    }

    async fn delete_ids(&mut self, table: Table, ids: &[String]) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        for id in ids {
            if tables.get(table, id).is_some() {
                tables.check_unreferenced(table, id)?;
            }
        }
        let mut deleted = 0;
        for id in ids {
            if tables.remove(table, id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn delete_children(
        &mut self,
        table: Table,
        parent_ids: &[String],
    ) -> Result<u64, StoreError> {
        let ids = self.ids_with_parent(table, parent_ids).await?;
        self.delete_ids(table, &ids).await
    }

    async fn count(&mut self, table: Table) -> Result<u64, StoreError> {
        Ok(self.tables.lock().await.len(table) as u64)
    }

    async fn units(&mut self) -> Result<Vec<Unit>, StoreError> {
        let tables = self.tables.lock().await;
        let mut units: Vec<Unit> = tables
            .rows(Table::Units)
            .filter_map(|row| match row {
                CatalogRow::Unit(u) => Some(u.clone()),
                _ => None,
            })
            .collect();
        units.sort_by(|a, b| {
            (&a.course_id, a.unit_number, &a.id).cmp(&(&b.course_id, b.unit_number, &b.id))
        });
        Ok(units)
    }

    async fn question_banks(&mut self) -> Result<Vec<QuestionBank>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .rows(Table::QuestionBanks)
            .filter_map(|row| match row {
                CatalogRow::QuestionBank(b) => Some(b.clone()),
                _ => None,
            })
            .collect())
    }

    async fn practice_exams(&mut self) -> Result<Vec<PracticeExam>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .rows(Table::PracticeExams)
            .filter_map(|row| match row {
                CatalogRow::PracticeExam(e) => Some(e.clone()),
                _ => None,
            })
            .collect())
    }

    async fn exam_questions(&mut self, exam_id: &str) -> Result<Vec<ExamQuestion>, StoreError> {
        let tables = self.tables.lock().await;
        let mut questions: Vec<ExamQuestion> = tables
            .rows(Table::ExamQuestions)
            .filter_map(|row| match row {
                CatalogRow::ExamQuestion(q) if q.exam_id == exam_id => Some(q.clone()),
                _ => None,
            })
            .collect();
        questions.sort_by(|a, b| (a.sequence, &a.id).cmp(&(b.sequence, &b.id)));
        Ok(questions)
    }

    async fn bank_question_counts(&mut self) -> Result<HashMap<String, u64>, StoreError> {
        let tables = self.tables.lock().await;
        let mut counts = HashMap::new();
        for row in tables.rows(Table::BankQuestions) {
            if let CatalogRow::BankQuestion(q) = row {
                *counts.entry(q.bank_id.clone()).or_default() += 1;
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cedu_core::{Course, ExtraFields, Lesson};

    fn course(id: &str) -> CatalogRow {
        CatalogRow::Course(Course {
            id: id.into(),
            title: format!("Course {id}"),
            description: None,
            state: Some("FL".into()),
            product_type: Some("real_estate".into()),
            hours_required: Some(14.0),
            price: Some(59.0),
            sku: None,
            created_at: None,
            updated_at: None,
            extra: ExtraFields::new(),
        })
    }

    fn unit(id: &str, course_id: &str) -> CatalogRow {
        CatalogRow::Unit(Unit {
            id: id.into(),
            course_id: course_id.into(),
            unit_number: 1,
            title: format!("Unit {id}"),
            description: None,
            hours_required: None,
            created_at: None,
            updated_at: None,
            extra: ExtraFields::new(),
        })
    }

    fn lesson(id: &str, unit_id: &str) -> CatalogRow {
        CatalogRow::Lesson(Lesson {
            id: id.into(),
            unit_id: unit_id.into(),
            lesson_number: 1,
            title: "Lesson".into(),
            content: None,
            duration_minutes: Some(50),
            created_at: None,
            updated_at: None,
            extra: ExtraFields::new(),
        })
    }

    #[tokio::test]
    async fn rollback_discards_transaction_writes() {
        let catalog = MemoryCatalog::new();
        let mut tx = catalog.begin().await.expect("begin");
        tx.upsert(&course("c1")).await.expect("upsert");
        assert_eq!(tx.count(Table::Courses).await.unwrap(), 1);
        catalog.rollback(tx).await.expect("rollback");

        let mut conn = catalog.connect().await.expect("connect");
        assert_eq!(conn.count(Table::Courses).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn commit_publishes_and_upsert_reports_updates() {
        let catalog = MemoryCatalog::new();
        let mut tx = catalog.begin().await.expect("begin");
        assert_eq!(tx.upsert(&course("c1")).await.unwrap(), Upserted::Inserted);
        assert_eq!(tx.upsert(&course("c1")).await.unwrap(), Upserted::Updated);
        catalog.commit(tx).await.expect("commit");
        assert_eq!(catalog.tables().await.len(Table::Courses), 1);
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced_both_ways() {
        let catalog = MemoryCatalog::new();
        let mut conn = catalog.connect().await.expect("connect");
        let err = conn.upsert(&unit("u1", "missing")).await.unwrap_err();
        assert!(matches!(err, StoreError::ForeignKey { .. }));

        conn.upsert(&course("c1")).await.unwrap();
        conn.upsert(&unit("u1", "c1")).await.unwrap();
        conn.upsert(&lesson("l1", "u1")).await.unwrap();
        let err = conn.delete_ids(Table::Units, &["u1".into()]).await.unwrap_err();
        assert!(matches!(err, StoreError::StillReferenced { .. }));

        assert_eq!(conn.delete_children(Table::Lessons, &["u1".into()]).await.unwrap(), 1);
        assert_eq!(conn.delete_ids(Table::Units, &["u1".into()]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn injected_failure_hits_the_nth_upsert_only() {
        let catalog = MemoryCatalog::new();
        catalog.fail_upsert_at(Table::Courses, 2);
        let mut tx = catalog.begin().await.expect("begin");
        tx.upsert(&course("c1")).await.expect("first");
        let err = tx.upsert(&course("c2")).await.unwrap_err();
        assert!(matches!(err, StoreError::InjectedFailure { nth: 2, .. }));
        tx.upsert(&course("c3")).await.expect("third");
    }

    #[tokio::test]
    async fn import_lock_is_exclusive_until_the_holder_ends() {
        let catalog = MemoryCatalog::new();
        let mut first = catalog.begin().await.unwrap();
        let mut second = catalog.begin().await.unwrap();
        assert!(first.try_lock_import().await.unwrap());
        assert!(!second.try_lock_import().await.unwrap());
        catalog.commit(first).await.unwrap();
        assert!(second.try_lock_import().await.unwrap());
    }
}
