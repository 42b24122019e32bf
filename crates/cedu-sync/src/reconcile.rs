//! Heals drift between question banks and legacy practice exams.
//!
//! Practice exams carry no unit foreign key; they are linked to units by the
//! numbers in their titles ("Hour 3 Quiz", "Unit 9 Quiz"). That linkage lives
//! behind [`LegacyLinkageResolver`] so a real foreign key can replace it in one
//! place.

use std::collections::HashSet;
use std::sync::OnceLock;

use cedu_core::{
    derived_id, BankQuestion, CatalogRecord, ExtraFields, PracticeExam, QuestionBank, Unit,
};
use cedu_storage::{CatalogDb, StoreError};
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditLog, Stage};

pub const DEFAULT_QUESTIONS_PER_ATTEMPT: i32 = 10;
pub const DEFAULT_PASSING_SCORE: i32 = 70;
pub const DEFAULT_DIFFICULTY: &str = "medium";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationSummary {
    pub banks_created: usize,
    pub questions_populated: usize,
    /// Pre-existing empty banks matched to a practice exam, counted even when
    /// that exam has no questions to copy.
    pub orphans_fixed: usize,
    /// Banks still without questions after reconciliation, matched or not.
    #[serde(default)]
    pub unmatched_banks: Vec<String>,
}

/// Associates legacy practice exams with units and banks.
pub trait LegacyLinkageResolver: Send + Sync {
    fn exam_for_unit<'a>(&self, unit: &Unit, exams: &'a [PracticeExam]) -> Option<&'a PracticeExam>;

    fn exam_for_bank<'a>(
        &self,
        bank: &QuestionBank,
        exams: &'a [PracticeExam],
    ) -> Option<&'a PracticeExam>;
}

/// Matches on `hour N` first, then `unit N`, within the same course.
#[derive(Debug, Clone, Copy, Default)]
pub struct TitlePatternResolver;

fn hour_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"hour (\d+)").expect("static pattern"))
}

fn unit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"unit (\d+)").expect("static pattern"))
}

fn title_number(pattern: &Regex, title: &str) -> Option<u64> {
    let lowered = title.to_lowercase();
    pattern
        .captures(&lowered)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn same_course(exam: &PracticeExam, course_id: &str) -> bool {
    exam.course_id.as_deref() == Some(course_id)
}

fn match_by_number<'a>(
    pattern: &Regex,
    title: &str,
    course_id: &str,
    exams: &'a [PracticeExam],
) -> Option<&'a PracticeExam> {
    let wanted = title_number(pattern, title)?;
    exams
        .iter()
        .filter(|exam| same_course(exam, course_id))
        .find(|exam| title_number(pattern, &exam.title) == Some(wanted))
}

impl LegacyLinkageResolver for TitlePatternResolver {
    fn exam_for_unit<'a>(&self, unit: &Unit, exams: &'a [PracticeExam]) -> Option<&'a PracticeExam> {
        match_by_number(hour_pattern(), &unit.title, &unit.course_id, exams)
            .or_else(|| match_by_number(unit_pattern(), &unit.title, &unit.course_id, exams))
    }

    fn exam_for_bank<'a>(
        &self,
        bank: &QuestionBank,
        exams: &'a [PracticeExam],
    ) -> Option<&'a PracticeExam> {
        let course_id = bank.course_id.as_deref()?;
        match_by_number(hour_pattern(), &bank.title, course_id, exams)
    }
}

/// Leading-integer parse of a legacy answer key; `"2"` is 2, `"0x1A"` is 26,
/// `"B"` is 0.
pub fn parse_correct_option(answer: &str) -> i32 {
    let trimmed = answer.trim_start();
    let (sign, rest) = match trimmed.as_bytes().first() {
        Some(b'-') => (-1i64, &trimmed[1..]),
        Some(b'+') => (1, &trimmed[1..]),
        _ => (1, trimmed),
    };
    let (radix, digits) = match rest.get(..2) {
        Some("0x" | "0X") => (16, &rest[2..]),
        _ => (10, rest),
    };
    let end = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    i64::from_str_radix(&digits[..end], radix)
        .ok()
        .and_then(|n| i32::try_from(sign * n).ok())
        .unwrap_or(0)
}

fn bank_for_unit(unit: &Unit) -> QuestionBank {
    let now = Utc::now();
    QuestionBank {
        id: derived_id("unit-bank", &unit.id),
        course_id: Some(unit.course_id.clone()),
        unit_id: Some(unit.id.clone()),
        title: format!("{} Quiz", unit.title),
        description: None,
        bank_type: "unit_quiz".to_string(),
        questions_per_attempt: DEFAULT_QUESTIONS_PER_ATTEMPT,
        passing_score: DEFAULT_PASSING_SCORE,
        is_active: true,
        created_at: Some(now),
        updated_at: Some(now),
        extra: ExtraFields::new(),
    }
}

/// Copy every question of `exam` into `bank_id`; returns how many were written.
async fn populate_from_exam(
    db: &mut dyn CatalogDb,
    exam: &PracticeExam,
    bank_id: &str,
) -> Result<usize, StoreError> {
    let questions = db.exam_questions(&exam.id).await?;
    let now = Utc::now();
    for question in &questions {
        let copied = BankQuestion {
            id: derived_id("bank-question", &format!("{bank_id}:{}", question.id)),
            bank_id: bank_id.to_string(),
            question_text: question.question_text.clone(),
            question_type: question.question_type.clone(),
            options: question.options.clone(),
            correct_option: parse_correct_option(&question.correct_answer),
            explanation: question.explanation.clone(),
            difficulty: Some(DEFAULT_DIFFICULTY.to_string()),
            is_active: true,
            created_at: Some(now),
            updated_at: Some(now),
            extra: ExtraFields::new(),
        };
        db.upsert(&copied.to_row()).await?;
    }
    Ok(questions.len())
}

/// Ensure every unit has a bank and every empty bank gets questions from a
/// matching practice exam when one exists.
pub async fn reconcile(
    db: &mut dyn CatalogDb,
    resolver: &dyn LegacyLinkageResolver,
    audit: &mut AuditLog,
) -> Result<ReconciliationSummary, StoreError> {
    let units = db.units().await?;
    let banks = db.question_banks().await?;
    let exams = db.practice_exams().await?;
    let question_counts = db.bank_question_counts().await?;
    let mut summary = ReconciliationSummary::default();

    let banked_units: HashSet<&str> = banks.iter().filter_map(|b| b.unit_id.as_deref()).collect();

    for unit in units.iter().filter(|u| !banked_units.contains(u.id.as_str())) {
        let bank = bank_for_unit(unit);
        db.upsert(&bank.to_row()).await?;
        summary.banks_created += 1;

        let populated = match resolver.exam_for_unit(unit, &exams) {
            Some(exam) => {
                let copied = populate_from_exam(db, exam, &bank.id).await?;
                audit.info(
                    Stage::Reconcile,
                    format!(
                        "created bank {} for unit {} with {copied} question(s) from exam {} ({})",
                        bank.id, unit.id, exam.id, exam.title
                    ),
                );
                copied
            }
            None => {
                audit.info(
                    Stage::Reconcile,
                    format!("created bank {} for unit {} ({}); no matching exam", bank.id, unit.id, unit.title),
                );
                0
            }
        };
        summary.questions_populated += populated;
        if populated == 0 {
            summary.unmatched_banks.push(bank.id.clone());
        }
    }

    for bank in &banks {
        if question_counts.get(&bank.id).copied().unwrap_or(0) > 0 {
            continue;
        }
        let copied = match resolver.exam_for_bank(bank, &exams) {
            Some(exam) => {
                let copied = populate_from_exam(db, exam, &bank.id).await?;
                audit.info(
                    Stage::Reconcile,
                    format!(
                        "populated empty bank {} with {copied} question(s) from exam {} ({})",
                        bank.id, exam.id, exam.title
                    ),
                );
                summary.orphans_fixed += 1;
                copied
            }
            None => 0,
        };
        summary.questions_populated += copied;
        if copied == 0 {
            summary.unmatched_banks.push(bank.id.clone());
        }
    }

    for bank_id in &summary.unmatched_banks {
        audit.warn(
            Stage::Reconcile,
            format!("question bank {bank_id} still has no questions after reconciliation"),
        );
    }
    audit.info_with(
        Stage::Reconcile,
        format!(
            "reconciliation: {} bank(s) created, {} question(s) populated, {} orphan(s) fixed",
            summary.banks_created, summary.questions_populated, summary.orphans_fixed
        ),
        serde_json::to_value(&summary).unwrap_or_default(),
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cedu_core::CatalogRow;
    use cedu_storage::{MemoryCatalog, TransactionProvider};

    fn exam(id: &str, course_id: Option<&str>, title: &str) -> PracticeExam {
        PracticeExam {
            id: id.into(),
            course_id: course_id.map(Into::into),
            title: title.into(),
            description: None,
            total_questions: 5,
            passing_score: 70,
            time_limit: None,
            is_final_exam: false,
            exam_form: None,
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

    #[test]
    fn hour_match_wins_over_unit_match() {
        let exams = [
            exam("e-unit", Some("c1"), "Unit 3 Quiz"),
            exam("e-hour", Some("c1"), "Hour 3 Quiz"),
        ];
        let found = TitlePatternResolver
            .exam_for_unit(&unit("u", "c1", "Unit 3 - Hour 3: Escrow"), &exams)
            .expect("match");
        assert_eq!(found.id, "e-hour");
    }

    #[test]
    fn unit_number_is_the_fallback() {
        let exams = [exam("e9", Some("c1"), "UNIT 9 QUIZ"), exam("e8", Some("c1"), "Unit 8 Quiz")];
        let found = TitlePatternResolver
            .exam_for_unit(&unit("u", "c1", "Unit 9: Contracts"), &exams)
            .expect("match");
        assert_eq!(found.id, "e9");
    }

    #[test]
    fn matches_never_cross_courses() {
        let exams = [exam("e3", Some("other"), "Hour 3 Quiz"), exam("e-null", None, "Hour 3 Quiz")];
        assert!(TitlePatternResolver
            .exam_for_unit(&unit("u", "c1", "Hour 3: Escrow"), &exams)
            .is_none());
    }

    #[test]
    fn titles_without_numbers_do_not_match() {
        let exams = [exam("e1", Some("c1"), "Final Exam")];
        assert!(TitlePatternResolver
            .exam_for_unit(&unit("u", "c1", "Introduction"), &exams)
            .is_none());
    }

    #[test]
    fn bank_matching_uses_hours_only() {
        let exams = [exam("e2", Some("c1"), "Unit 2 Quiz"), exam("h2", Some("c1"), "Hour 2 Quiz")];
        let mut bank = bank_for_unit(&unit("u2", "c1", "Unit 2"));
        assert!(TitlePatternResolver.exam_for_bank(&bank, &exams).is_none());
        bank.title = "Hour 2 Review".into();
        assert_eq!(TitlePatternResolver.exam_for_bank(&bank, &exams).unwrap().id, "h2");
        bank.course_id = None;
        assert!(TitlePatternResolver.exam_for_bank(&bank, &exams).is_none());
    }

    #[test]
    fn correct_option_follows_leading_integer_rules() {
        assert_eq!(parse_correct_option("2"), 2);
        assert_eq!(parse_correct_option(" 3) Mortgage"), 3);
        assert_eq!(parse_correct_option("B"), 0);
        assert_eq!(parse_correct_option(""), 0);
        assert_eq!(parse_correct_option("-1"), -1);
        assert_eq!(parse_correct_option("99999999999"), 0);
    }

    #[test]
    fn hex_prefixed_answers_parse_as_hex() {
        assert_eq!(parse_correct_option("0x1A"), 26);
        assert_eq!(parse_correct_option("0X2"), 2);
        assert_eq!(parse_correct_option("-0x3"), -3);
        assert_eq!(parse_correct_option("0x"), 0);
        assert_eq!(parse_correct_option("0xZ"), 0);
        assert_eq!(parse_correct_option("012"), 12);
    }

    #[tokio::test]
    async fn matched_empty_bank_counts_as_fixed_even_without_questions() {
        let catalog = MemoryCatalog::new();
        let mut bank = bank_for_unit(&unit("u4", "c1", "Hour 4 Review"));
        bank.id = "qb-review".into();
        bank.unit_id = None;
        bank.title = "Hour 4 Review".into();
        catalog
            .seed([
                CatalogRow::QuestionBank(bank),
                CatalogRow::PracticeExam(exam("e4", Some("c1"), "Hour 4 Quiz")),
            ])
            .await;

        let mut conn = catalog.connect().await.unwrap();
        let mut audit = AuditLog::new();
        let summary = reconcile(&mut conn, &TitlePatternResolver, &mut audit)
            .await
            .unwrap();

        assert_eq!(summary.orphans_fixed, 1);
        assert_eq!(summary.questions_populated, 0);
        assert_eq!(summary.banks_created, 0);
        assert_eq!(summary.unmatched_banks, vec!["qb-review".to_string()]);
        assert!(audit.warnings()[0].contains("qb-review"));
    }

    #[test]
    fn created_banks_use_defaults_and_stable_ids() {
        let u = unit("u7", "c1", "Hour 7: Closing");
        let bank = bank_for_unit(&u);
        assert_eq!(bank.title, "Hour 7: Closing Quiz");
        assert_eq!(bank.questions_per_attempt, 10);
        assert_eq!(bank.passing_score, 70);
        assert_eq!(bank.id, bank_for_unit(&u).id);
    }
}
