//! Catalog content graph and snapshot types for the course platform.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cedu-core";

/// Keys present on a snapshot row that the typed schema does not know about.
pub type ExtraFields = BTreeMap<String, JsonValue>;

/// Catalog tables, listed in import (foreign-key) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Table {
    Courses,
    Units,
    Lessons,
    QuestionBanks,
    BankQuestions,
    PracticeExams,
    ExamQuestions,
    Bundles,
    BundleCourses,
}

impl Table {
    pub const ALL: [Table; 9] = [
        Table::Courses,
        Table::Units,
        Table::Lessons,
        Table::QuestionBanks,
        Table::BankQuestions,
        Table::PracticeExams,
        Table::ExamQuestions,
        Table::Bundles,
        Table::BundleCourses,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Table::Courses => "courses",
            Table::Units => "units",
            Table::Lessons => "lessons",
            Table::QuestionBanks => "question_banks",
            Table::BankQuestions => "bank_questions",
            Table::PracticeExams => "practice_exams",
            Table::ExamQuestions => "exam_questions",
            Table::Bundles => "bundles",
            Table::BundleCourses => "bundle_courses",
        }
    }

    /// Key of the array holding this table's rows in a snapshot file.
    pub fn snapshot_key(self) -> &'static str {
        match self {
            Table::Courses => "courses",
            Table::Units => "units",
            Table::Lessons => "lessons",
            Table::QuestionBanks => "questionBanks",
            Table::BankQuestions => "bankQuestions",
            Table::PracticeExams => "practiceExams",
            Table::ExamQuestions => "examQuestions",
            Table::Bundles => "bundles",
            Table::BundleCourses => "bundleCourses",
        }
    }

    /// Column used to scope stale cleanup and cascades to a parent.
    pub fn parent_column(self) -> Option<&'static str> {
        match self {
            Table::Courses | Table::Bundles => None,
            Table::Units | Table::QuestionBanks | Table::PracticeExams => Some("course_id"),
            Table::Lessons => Some("unit_id"),
            Table::BankQuestions => Some("bank_id"),
            Table::ExamQuestions => Some("exam_id"),
            Table::BundleCourses => Some("bundle_id"),
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Accepts `59`, `59.0` or `"59.00"`; decimal columns are often exported as strings.
fn de_opt_decimal<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Decimal {
        Number(f64),
        Text(String),
    }

    match Option::<Decimal>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Decimal::Number(n)) => Ok(Some(n)),
        Some(Decimal::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(Decimal::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid decimal {s:?}"))),
    }
}

fn default_bank_type() -> String {
    "unit_quiz".to_string()
}

fn default_questions_per_attempt() -> i32 {
    10
}

fn default_passing_score() -> i32 {
    70
}

fn default_question_type() -> String {
    "multiple_choice".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub product_type: Option<String>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    pub hours_required: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    pub price: Option<f64>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: ExtraFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    pub id: String,
    pub course_id: String,
    pub unit_number: i32,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    pub hours_required: Option<f64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: ExtraFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    pub id: String,
    pub unit_id: String,
    pub lesson_number: i32,
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, alias = "duration")]
    pub duration_minutes: Option<i32>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: ExtraFields,
}

/// Quiz pool in the current representation; ideally one per unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionBank {
    pub id: String,
    #[serde(default)]
    pub course_id: Option<String>,
    #[serde(default)]
    pub unit_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_bank_type")]
    pub bank_type: String,
    #[serde(default = "default_questions_per_attempt")]
    pub questions_per_attempt: i32,
    #[serde(default = "default_passing_score")]
    pub passing_score: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: ExtraFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankQuestion {
    pub id: String,
    pub bank_id: String,
    pub question_text: String,
    #[serde(default = "default_question_type")]
    pub question_type: String,
    /// Answer choices, passed through as exported.
    #[serde(default)]
    pub options: JsonValue,
    #[serde(default)]
    pub correct_option: i32,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: ExtraFields,
}

/// Legacy quiz representation. Tied to units only through its title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PracticeExam {
    pub id: String,
    #[serde(default)]
    pub course_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub total_questions: i32,
    #[serde(default = "default_passing_score")]
    pub passing_score: i32,
    #[serde(default)]
    pub time_limit: Option<i32>,
    #[serde(default)]
    pub is_final_exam: bool,
    #[serde(default)]
    pub exam_form: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: ExtraFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamQuestion {
    pub id: String,
    pub exam_id: String,
    pub question_text: String,
    #[serde(default = "default_question_type")]
    pub question_type: String,
    #[serde(default)]
    pub options: JsonValue,
    #[serde(default)]
    pub correct_answer: String,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub sequence: i32,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: ExtraFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    pub price: Option<f64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: ExtraFields,
}

/// Join row keyed by `(bundle_id, course_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleCourse {
    pub bundle_id: String,
    pub course_id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: ExtraFields,
}

/// Any catalog row, tagged by the table it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CatalogRow {
    Course(Course),
    Unit(Unit),
    Lesson(Lesson),
    QuestionBank(QuestionBank),
    BankQuestion(BankQuestion),
    PracticeExam(PracticeExam),
    ExamQuestion(ExamQuestion),
    Bundle(Bundle),
    BundleCourse(BundleCourse),
}

impl CatalogRow {
    pub fn table(&self) -> Table {
        match self {
            CatalogRow::Course(_) => Table::Courses,
            CatalogRow::Unit(_) => Table::Units,
            CatalogRow::Lesson(_) => Table::Lessons,
            CatalogRow::QuestionBank(_) => Table::QuestionBanks,
            CatalogRow::BankQuestion(_) => Table::BankQuestions,
            CatalogRow::PracticeExam(_) => Table::PracticeExams,
            CatalogRow::ExamQuestion(_) => Table::ExamQuestions,
            CatalogRow::Bundle(_) => Table::Bundles,
            CatalogRow::BundleCourse(_) => Table::BundleCourses,
        }
    }

    pub fn id(&self) -> String {
        match self {
            CatalogRow::Course(r) => r.id(),
            CatalogRow::Unit(r) => r.id(),
            CatalogRow::Lesson(r) => r.id(),
            CatalogRow::QuestionBank(r) => r.id(),
            CatalogRow::BankQuestion(r) => r.id(),
            CatalogRow::PracticeExam(r) => r.id(),
            CatalogRow::ExamQuestion(r) => r.id(),
            CatalogRow::Bundle(r) => r.id(),
            CatalogRow::BundleCourse(r) => r.id(),
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        match self {
            CatalogRow::Course(r) => r.parent_id(),
            CatalogRow::Unit(r) => r.parent_id(),
            CatalogRow::Lesson(r) => r.parent_id(),
            CatalogRow::QuestionBank(r) => r.parent_id(),
            CatalogRow::BankQuestion(r) => r.parent_id(),
            CatalogRow::PracticeExam(r) => r.parent_id(),
            CatalogRow::ExamQuestion(r) => r.parent_id(),
            CatalogRow::Bundle(r) => r.parent_id(),
            CatalogRow::BundleCourse(r) => r.parent_id(),
        }
    }
}

/// Common shape of every importable record.
pub trait CatalogRecord: Clone + Send + Sync {
    const TABLE: Table;

    /// Stable identity used for upsert; composite for join rows.
    fn id(&self) -> String;

    /// Value of [`Table::parent_column`] for this row.
    fn parent_id(&self) -> Option<&str>;

    fn extra(&self) -> &ExtraFields;

    fn to_row(&self) -> CatalogRow;
}

macro_rules! catalog_record {
    ($ty:ident, $table:expr, $variant:ident, |$r:ident| $parent:expr) => {
        impl CatalogRecord for $ty {
            const TABLE: Table = $table;

            fn id(&self) -> String {
                self.id.clone()
            }

            fn parent_id(&self) -> Option<&str> {
                let $r = self;
                $parent
            }

            fn extra(&self) -> &ExtraFields {
                &self.extra
            }

            fn to_row(&self) -> CatalogRow {
                CatalogRow::$variant(self.clone())
            }
        }
    };
}

catalog_record!(Course, Table::Courses, Course, |_r| None);
catalog_record!(Unit, Table::Units, Unit, |r| Some(r.course_id.as_str()));
catalog_record!(Lesson, Table::Lessons, Lesson, |r| Some(r.unit_id.as_str()));
catalog_record!(QuestionBank, Table::QuestionBanks, QuestionBank, |r| r.course_id.as_deref());
catalog_record!(BankQuestion, Table::BankQuestions, BankQuestion, |r| Some(r.bank_id.as_str()));
catalog_record!(PracticeExam, Table::PracticeExams, PracticeExam, |r| r.course_id.as_deref());
catalog_record!(ExamQuestion, Table::ExamQuestions, ExamQuestion, |r| Some(r.exam_id.as_str()));
catalog_record!(Bundle, Table::Bundles, Bundle, |_r| None);

impl CatalogRecord for BundleCourse {
    const TABLE: Table = Table::BundleCourses;

    fn id(&self) -> String {
        bundle_course_key(&self.bundle_id, &self.course_id)
    }

    fn parent_id(&self) -> Option<&str> {
        Some(self.bundle_id.as_str())
    }

    fn extra(&self) -> &ExtraFields {
        &self.extra
    }

    fn to_row(&self) -> CatalogRow {
        CatalogRow::BundleCourse(self.clone())
    }
}

pub fn bundle_course_key(bundle_id: &str, course_id: &str) -> String {
    format!("{bundle_id}:{course_id}")
}

/// Versioned export of the whole catalog graph.
///
/// Sections are optional on the wire so that a missing array can be reported
/// by validation instead of failing the parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSnapshot {
    pub version: String,
    #[serde(default)]
    pub exported_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub courses: Option<Vec<Course>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<Vec<Unit>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lessons: Option<Vec<Lesson>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_banks: Option<Vec<QuestionBank>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_questions: Option<Vec<BankQuestion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub practice_exams: Option<Vec<PracticeExam>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exam_questions: Option<Vec<ExamQuestion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundles: Option<Vec<Bundle>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_courses: Option<Vec<BundleCourse>>,
}

impl CatalogSnapshot {
    pub fn courses(&self) -> &[Course] {
        self.courses.as_deref().unwrap_or_default()
    }

    pub fn units(&self) -> &[Unit] {
        self.units.as_deref().unwrap_or_default()
    }

    pub fn lessons(&self) -> &[Lesson] {
        self.lessons.as_deref().unwrap_or_default()
    }

    pub fn question_banks(&self) -> &[QuestionBank] {
        self.question_banks.as_deref().unwrap_or_default()
    }

    pub fn bank_questions(&self) -> &[BankQuestion] {
        self.bank_questions.as_deref().unwrap_or_default()
    }

    pub fn practice_exams(&self) -> &[PracticeExam] {
        self.practice_exams.as_deref().unwrap_or_default()
    }

    pub fn exam_questions(&self) -> &[ExamQuestion] {
        self.exam_questions.as_deref().unwrap_or_default()
    }

    pub fn bundles(&self) -> &[Bundle] {
        self.bundles.as_deref().unwrap_or_default()
    }

    pub fn bundle_courses(&self) -> &[BundleCourse] {
        self.bundle_courses.as_deref().unwrap_or_default()
    }

    pub fn section_len(&self, table: Table) -> usize {
        match table {
            Table::Courses => self.courses().len(),
            Table::Units => self.units().len(),
            Table::Lessons => self.lessons().len(),
            Table::QuestionBanks => self.question_banks().len(),
            Table::BankQuestions => self.bank_questions().len(),
            Table::PracticeExams => self.practice_exams().len(),
            Table::ExamQuestions => self.exam_questions().len(),
            Table::Bundles => self.bundles().len(),
            Table::BundleCourses => self.bundle_courses().len(),
        }
    }

    pub fn missing_sections(&self) -> Vec<Table> {
        let present = [
            self.courses.is_some(),
            self.units.is_some(),
            self.lessons.is_some(),
            self.question_banks.is_some(),
            self.bank_questions.is_some(),
            self.practice_exams.is_some(),
            self.exam_questions.is_some(),
            self.bundles.is_some(),
            self.bundle_courses.is_some(),
        ];
        Table::ALL
            .into_iter()
            .zip(present)
            .filter_map(|(table, present)| (!present).then_some(table))
            .collect()
    }
}

/// Deterministic id for rows the reconciler derives from another row.
pub fn derived_id(kind: &str, source_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("cedu:{kind}:{source_id}").as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_sections_are_optional_on_the_wire() {
        let snapshot: CatalogSnapshot = serde_json::from_str(
            r#"{"version":"3","exportedAt":"2025-01-05T10:00:00Z","courses":[],"units":[]}"#,
        )
        .expect("parse");
        assert_eq!(snapshot.section_len(Table::Courses), 0);
        let missing = snapshot.missing_sections();
        assert_eq!(missing.len(), 7);
        assert!(missing.contains(&Table::BundleCourses));
        assert!(!missing.contains(&Table::Units));
    }

    #[test]
    fn unknown_keys_are_kept_for_schema_warnings() {
        let unit: Unit = serde_json::from_str(
            r#"{"id":"u1","courseId":"c1","unitNumber":1,"title":"Hour 1: Agency","legacyCode":"A-1"}"#,
        )
        .expect("parse");
        assert_eq!(unit.extra.len(), 1);
        assert!(unit.extra.contains_key("legacyCode"));
        assert_eq!(unit.parent_id(), Some("c1"));
    }

    #[test]
    fn decimal_columns_accept_strings_and_numbers() {
        let course: Course = serde_json::from_str(
            r#"{"id":"c1","title":"FL Sales Associate","price":"59.00","hoursRequired":63}"#,
        )
        .expect("parse");
        assert_eq!(course.price, Some(59.0));
        assert_eq!(course.hours_required, Some(63.0));
    }

    #[test]
    fn created_at_round_trips_to_the_same_instant() {
        let raw = "2024-03-01T12:30:45.123-05:00";
        let course: Course = serde_json::from_str(&format!(
            r#"{{"id":"c1","title":"T","createdAt":"{raw}"}}"#
        ))
        .expect("parse");
        let reserialized = serde_json::to_value(&course).expect("serialize");
        let back: DateTime<Utc> = reserialized["createdAt"]
            .as_str()
            .expect("string")
            .parse()
            .expect("instant");
        let original = DateTime::parse_from_rfc3339(raw).expect("rfc3339");
        assert_eq!(back, original.with_timezone(&Utc));
    }

    #[test]
    fn bundle_course_identity_is_composite() {
        let link = BundleCourse {
            bundle_id: "b1".into(),
            course_id: "c9".into(),
            created_at: None,
            extra: ExtraFields::new(),
        };
        assert_eq!(link.id(), "b1:c9");
        assert_eq!(link.to_row().table(), Table::BundleCourses);
    }

    #[test]
    fn derived_ids_are_stable() {
        assert_eq!(derived_id("unit-bank", "u1"), derived_id("unit-bank", "u1"));
        assert_ne!(derived_id("unit-bank", "u1"), derived_id("unit-bank", "u2"));
    }
}
