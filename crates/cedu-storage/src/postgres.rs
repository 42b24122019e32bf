//! Postgres backend. A single [`CatalogDb`] implementation serves both
//! transactions and pooled connections through `DerefMut<Target = PgConnection>`.

use std::collections::HashMap;
use std::ops::DerefMut;

use async_trait::async_trait;
use cedu_core::{CatalogRow, ExamQuestion, ExtraFields, PracticeExam, QuestionBank, Table, Unit};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::debug;

use crate::{CatalogDb, StoreError, TransactionProvider, Upserted};

/// Advisory lock key held by the transaction of an import run.
pub const IMPORT_LOCK_KEY: i64 = 0x6365_6475_0001;

#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionProvider for PgCatalog {
    type Tx = PgHandle<Transaction<'static, Postgres>>;
    type Conn = PgHandle<PoolConnection<Postgres>>;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(PgHandle::new(self.pool.begin().await?))
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.into_inner().commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.into_inner().rollback().await?;
        Ok(())
    }

    async fn connect(&self) -> Result<Self::Conn, StoreError> {
        Ok(PgHandle::new(self.pool.acquire().await?))
    }
}

/// Catalog access over a transaction or a plain connection.
pub struct PgHandle<C> {
    conn: C,
}

impl<C> PgHandle<C> {
    pub fn new(conn: C) -> Self {
        Self { conn }
    }

    pub fn into_inner(self) -> C {
        self.conn
    }
}

fn id_expr(table: Table) -> &'static str {
    match table {
        Table::BundleCourses => "(bundle_id || ':' || course_id)",
        _ => "id",
    }
}

fn parent_expr(table: Table) -> &'static str {
    // Tables without a parent never match a parent filter.
    table.parent_column().unwrap_or("NULL::text")
}

fn unit_from_row(row: &PgRow) -> Result<Unit, sqlx::Error> {
    Ok(Unit {
        id: row.try_get("id")?,
        course_id: row.try_get("course_id")?,
        unit_number: row.try_get("unit_number")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        hours_required: row.try_get("hours_required")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        extra: ExtraFields::new(),
    })
}

fn bank_from_row(row: &PgRow) -> Result<QuestionBank, sqlx::Error> {
    Ok(QuestionBank {
        id: row.try_get("id")?,
        course_id: row.try_get("course_id")?,
        unit_id: row.try_get("unit_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        bank_type: row.try_get("bank_type")?,
        questions_per_attempt: row.try_get("questions_per_attempt")?,
        passing_score: row.try_get("passing_score")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        extra: ExtraFields::new(),
    })
}

fn exam_from_row(row: &PgRow) -> Result<PracticeExam, sqlx::Error> {
    Ok(PracticeExam {
        id: row.try_get("id")?,
        course_id: row.try_get("course_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        total_questions: row.try_get("total_questions")?,
        passing_score: row.try_get("passing_score")?,
        time_limit: row.try_get("time_limit")?,
        is_final_exam: row.try_get("is_final_exam")?,
        exam_form: row.try_get("exam_form")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        extra: ExtraFields::new(),
    })
}

fn exam_question_from_row(row: &PgRow) -> Result<ExamQuestion, sqlx::Error> {
    Ok(ExamQuestion {
        id: row.try_get("id")?,
        exam_id: row.try_get("exam_id")?,
        question_text: row.try_get("question_text")?,
        question_type: row.try_get("question_type")?,
        options: row.try_get("options")?,
        correct_answer: row.try_get("correct_answer")?,
        explanation: row.try_get("explanation")?,
        sequence: row.try_get("sequence")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        extra: ExtraFields::new(),
    })
}

#[async_trait]
impl<C> CatalogDb for PgHandle<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    async fn try_lock_import(&mut self) -> Result<bool, StoreError> {
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(IMPORT_LOCK_KEY)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(locked)
    }

    async fn upsert(&mut self, row: &CatalogRow) -> Result<Upserted, StoreError> {
        let conn: &mut PgConnection = &mut self.conn;
        let result = match row {
            CatalogRow::Course(c) => {
                sqlx::query(
                    r#"
                    INSERT INTO courses
                        (id, title, description, state, product_type, hours_required,
                         price, sku, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    ON CONFLICT (id) DO UPDATE SET
                        title = EXCLUDED.title,
                        description = EXCLUDED.description,
                        state = EXCLUDED.state,
                        product_type = EXCLUDED.product_type,
                        hours_required = EXCLUDED.hours_required,
                        price = EXCLUDED.price,
                        sku = EXCLUDED.sku,
                        created_at = EXCLUDED.created_at,
                        updated_at = EXCLUDED.updated_at
                    RETURNING (xmax = 0) AS inserted
                    "#,
                )
                .bind(&c.id)
                .bind(&c.title)
                .bind(&c.description)
                .bind(&c.state)
                .bind(&c.product_type)
                .bind(c.hours_required)
                .bind(c.price)
                .bind(&c.sku)
                .bind(c.created_at)
                .bind(c.updated_at)
                .fetch_one(conn)
                .await
            }
            CatalogRow::Unit(u) => {
                sqlx::query(
                    r#"
                    INSERT INTO units
                        (id, course_id, unit_number, title, description, hours_required,
                         created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (id) DO UPDATE SET
                        course_id = EXCLUDED.course_id,
                        unit_number = EXCLUDED.unit_number,
                        title = EXCLUDED.title,
                        description = EXCLUDED.description,
                        hours_required = EXCLUDED.hours_required,
                        created_at = EXCLUDED.created_at,
                        updated_at = EXCLUDED.updated_at
                    RETURNING (xmax = 0) AS inserted
                    "#,
                )
                .bind(&u.id)
                .bind(&u.course_id)
                .bind(u.unit_number)
                .bind(&u.title)
                .bind(&u.description)
                .bind(u.hours_required)
                .bind(u.created_at)
                .bind(u.updated_at)
                .fetch_one(conn)
                .await
            }
            CatalogRow::Lesson(l) => {
                sqlx::query(
                    r#"
                    INSERT INTO lessons
                        (id, unit_id, lesson_number, title, content, duration_minutes,
                         created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (id) DO UPDATE SET
                        unit_id = EXCLUDED.unit_id,
                        lesson_number = EXCLUDED.lesson_number,
                        title = EXCLUDED.title,
                        content = EXCLUDED.content,
                        duration_minutes = EXCLUDED.duration_minutes,
                        created_at = EXCLUDED.created_at,
                        updated_at = EXCLUDED.updated_at
                    RETURNING (xmax = 0) AS inserted
                    "#,
                )
                .bind(&l.id)
                .bind(&l.unit_id)
                .bind(l.lesson_number)
                .bind(&l.title)
                .bind(&l.content)
                .bind(l.duration_minutes)
                .bind(l.created_at)
                .bind(l.updated_at)
                .fetch_one(conn)
                .await
            }
            CatalogRow::QuestionBank(b) => {
                sqlx::query(
                    r#"
                    INSERT INTO question_banks
                        (id, course_id, unit_id, title, description, bank_type,
                         questions_per_attempt, passing_score, is_active, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    ON CONFLICT (id) DO UPDATE SET
                        course_id = EXCLUDED.course_id,
                        unit_id = EXCLUDED.unit_id,
                        title = EXCLUDED.title,
                        description = EXCLUDED.description,
                        bank_type = EXCLUDED.bank_type,
                        questions_per_attempt = EXCLUDED.questions_per_attempt,
                        passing_score = EXCLUDED.passing_score,
                        is_active = EXCLUDED.is_active,
                        created_at = EXCLUDED.created_at,
                        updated_at = EXCLUDED.updated_at
                    RETURNING (xmax = 0) AS inserted
                    "#,
                )
                .bind(&b.id)
                .bind(&b.course_id)
                .bind(&b.unit_id)
                .bind(&b.title)
                .bind(&b.description)
                .bind(&b.bank_type)
                .bind(b.questions_per_attempt)
                .bind(b.passing_score)
                .bind(b.is_active)
                .bind(b.created_at)
                .bind(b.updated_at)
                .fetch_one(conn)
                .await
            }
            CatalogRow::BankQuestion(q) => {
                sqlx::query(
                    r#"
                    INSERT INTO bank_questions
                        (id, bank_id, question_text, question_type, options, correct_option,
                         explanation, difficulty, is_active, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    ON CONFLICT (id) DO UPDATE SET
                        bank_id = EXCLUDED.bank_id,
                        question_text = EXCLUDED.question_text,
                        question_type = EXCLUDED.question_type,
                        options = EXCLUDED.options,
                        correct_option = EXCLUDED.correct_option,
                        explanation = EXCLUDED.explanation,
                        difficulty = EXCLUDED.difficulty,
                        is_active = EXCLUDED.is_active,
                        created_at = EXCLUDED.created_at,
                        updated_at = EXCLUDED.updated_at
                    RETURNING (xmax = 0) AS inserted
                    "#,
                )
                .bind(&q.id)
                .bind(&q.bank_id)
                .bind(&q.question_text)
                .bind(&q.question_type)
                .bind(&q.options)
                .bind(q.correct_option)
                .bind(&q.explanation)
                .bind(&q.difficulty)
                .bind(q.is_active)
                .bind(q.created_at)
                .bind(q.updated_at)
                .fetch_one(conn)
                .await
            }
            CatalogRow::PracticeExam(e) => {
                sqlx::query(
                    r#"
                    INSERT INTO practice_exams
                        (id, course_id, title, description, total_questions, passing_score,
                         time_limit, is_final_exam, exam_form, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    ON CONFLICT (id) DO UPDATE SET
                        course_id = EXCLUDED.course_id,
                        title = EXCLUDED.title,
                        description = EXCLUDED.description,
                        total_questions = EXCLUDED.total_questions,
                        passing_score = EXCLUDED.passing_score,
                        time_limit = EXCLUDED.time_limit,
                        is_final_exam = EXCLUDED.is_final_exam,
                        exam_form = EXCLUDED.exam_form,
                        created_at = EXCLUDED.created_at,
                        updated_at = EXCLUDED.updated_at
                    RETURNING (xmax = 0) AS inserted
                    "#,
                )
                .bind(&e.id)
                .bind(&e.course_id)
                .bind(&e.title)
                .bind(&e.description)
                .bind(e.total_questions)
                .bind(e.passing_score)
                .bind(e.time_limit)
                .bind(e.is_final_exam)
                .bind(&e.exam_form)
                .bind(e.created_at)
                .bind(e.updated_at)
                .fetch_one(conn)
                .await
            }
            CatalogRow::ExamQuestion(q) => {
                sqlx::query(
                    r#"
                    INSERT INTO exam_questions
                        (id, exam_id, question_text, question_type, options, correct_answer,
                         explanation, sequence, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    ON CONFLICT (id) DO UPDATE SET
                        exam_id = EXCLUDED.exam_id,
                        question_text = EXCLUDED.question_text,
                        question_type = EXCLUDED.question_type,
                        options = EXCLUDED.options,
                        correct_answer = EXCLUDED.correct_answer,
                        explanation = EXCLUDED.explanation,
                        sequence = EXCLUDED.sequence,
                        created_at = EXCLUDED.created_at,
                        updated_at = EXCLUDED.updated_at
                    RETURNING (xmax = 0) AS inserted
                    "#,
                )
                .bind(&q.id)
                .bind(&q.exam_id)
                .bind(&q.question_text)
                .bind(&q.question_type)
                .bind(&q.options)
                .bind(&q.correct_answer)
                .bind(&q.explanation)
                .bind(q.sequence)
                .bind(q.created_at)
                .bind(q.updated_at)
                .fetch_one(conn)
                .await
            }
            CatalogRow::Bundle(b) => {
                sqlx::query(
                    r#"
                    INSERT INTO bundles (id, title, description, price, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (id) DO UPDATE SET
                        title = EXCLUDED.title,
                        description = EXCLUDED.description,
                        price = EXCLUDED.price,
                        created_at = EXCLUDED.created_at,
                        updated_at = EXCLUDED.updated_at
                    RETURNING (xmax = 0) AS inserted
                    "#,
                )
                .bind(&b.id)
                .bind(&b.title)
                .bind(&b.description)
                .bind(b.price)
                .bind(b.created_at)
                .bind(b.updated_at)
                .fetch_one(conn)
                .await
            }
            CatalogRow::BundleCourse(link) => {
                sqlx::query(
                    r#"
                    INSERT INTO bundle_courses (bundle_id, course_id, created_at)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (bundle_id, course_id) DO UPDATE SET
                        created_at = EXCLUDED.created_at
                    RETURNING (xmax = 0) AS inserted
                    "#,
                )
                .bind(&link.bundle_id)
                .bind(&link.course_id)
                .bind(link.created_at)
                .fetch_one(conn)
                .await
            }
        }?;

        let inserted: bool = result.try_get("inserted")?;
        Ok(if inserted {
            Upserted::Inserted
        } else {
            Upserted::Updated
        })
    }

    async fn ids_with_parent(
        &mut self,
        table: Table,
        parent_ids: &[String],
    ) -> Result<Vec<String>, StoreError> {
        if parent_ids.is_empty() || table.parent_column().is_none() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} AS id FROM {} WHERE {} = ANY($1)",
            id_expr(table),
            table.as_str(),
            parent_expr(table)
        );
        let ids = sqlx::query_scalar::<_, String>(&sql)
            .bind(parent_ids)
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(ids)
    }

    async fn delete_ids(&mut self, table: Table, ids: &[String]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {} WHERE {} = ANY($1)",
            table.as_str(),
            id_expr(table)
        );
        let deleted = sqlx::query(&sql)
            .bind(ids)
            .execute(&mut *self.conn)
            .await?
            .rows_affected();
        debug!(table = %table, deleted, "deleted rows by id");
        Ok(deleted)
    }

    async fn delete_children(
        &mut self,
        table: Table,
        parent_ids: &[String],
    ) -> Result<u64, StoreError> {
        if parent_ids.is_empty() || table.parent_column().is_none() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {} WHERE {} = ANY($1)",
            table.as_str(),
            parent_expr(table)
        );
        let deleted = sqlx::query(&sql)
            .bind(parent_ids)
            .execute(&mut *self.conn)
            .await?
            .rows_affected();
        debug!(table = %table, deleted, "deleted child rows");
        Ok(deleted)
    }

    async fn count(&mut self, table: Table) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.as_str());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&mut *self.conn).await?;
        Ok(count.max(0) as u64)
    }

    async fn units(&mut self) -> Result<Vec<Unit>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, course_id, unit_number, title, description, hours_required,
                   created_at, updated_at
              FROM units
             ORDER BY course_id, unit_number, id
            "#,
        )
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows.iter().map(unit_from_row).collect::<Result<_, _>>()?)
    }

    async fn question_banks(&mut self) -> Result<Vec<QuestionBank>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, course_id, unit_id, title, description, bank_type,
                   questions_per_attempt, passing_score, is_active, created_at, updated_at
              FROM question_banks
             ORDER BY id
            "#,
        )
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows.iter().map(bank_from_row).collect::<Result<_, _>>()?)
    }

    async fn practice_exams(&mut self) -> Result<Vec<PracticeExam>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, course_id, title, description, total_questions, passing_score,
                   time_limit, is_final_exam, exam_form, created_at, updated_at
              FROM practice_exams
             ORDER BY id
            "#,
        )
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows.iter().map(exam_from_row).collect::<Result<_, _>>()?)
    }

    async fn exam_questions(&mut self, exam_id: &str) -> Result<Vec<ExamQuestion>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, exam_id, question_text, question_type, options, correct_answer,
                   explanation, sequence, created_at, updated_at
              FROM exam_questions
             WHERE exam_id = $1
             ORDER BY sequence, id
            "#,
        )
        .bind(exam_id)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows
            .iter()
            .map(exam_question_from_row)
            .collect::<Result<_, _>>()?)
    }

    async fn bank_question_counts(&mut self) -> Result<HashMap<String, u64>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT bank_id, COUNT(*) AS questions
              FROM bank_questions
             GROUP BY bank_id
            "#,
        )
        .fetch_all(&mut *self.conn)
        .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let bank_id: String = row.try_get("bank_id")?;
            let questions: i64 = row.try_get("questions")?;
            out.insert(bank_id, questions.max(0) as u64);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_rows_are_addressed_by_composite_id() {
        assert_eq!(id_expr(Table::BundleCourses), "(bundle_id || ':' || course_id)");
        assert_eq!(id_expr(Table::Units), "id");
    }

    #[test]
    fn parentless_tables_never_match_a_parent_filter() {
        assert_eq!(parent_expr(Table::Courses), "NULL::text");
        assert_eq!(parent_expr(Table::Lessons), "unit_id");
        assert_eq!(parent_expr(Table::QuestionBanks), "course_id");
    }
}
