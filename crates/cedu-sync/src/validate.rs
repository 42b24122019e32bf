//! Referential-integrity and schema checks over an in-memory snapshot.
//! Pure: no I/O, no database.

use std::collections::HashSet;

use cedu_core::{CatalogRecord, CatalogSnapshot, Table};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub ok: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

fn id_set<R: CatalogRecord>(records: &[R]) -> HashSet<String> {
    records.iter().map(CatalogRecord::id).collect()
}

fn check_duplicates<R: CatalogRecord>(records: &[R], errors: &mut Vec<String>) {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        let id = record.id();
        if !seen.insert(id.clone()) {
            errors.push(format!("{} contains duplicate id {id}", R::TABLE.snapshot_key()));
        }
    }
}

fn check_unknown_fields<R: CatalogRecord>(records: &[R], warnings: &mut Vec<String>) {
    for (idx, record) in records.iter().enumerate() {
        if record.extra().is_empty() {
            continue;
        }
        let keys = record.extra().keys().cloned().collect::<Vec<_>>().join(", ");
        warnings.push(format!(
            "{}[{idx}] ({}) has unknown field(s): {keys}",
            R::TABLE.snapshot_key(),
            record.id()
        ));
    }
}

pub fn validate(snapshot: &CatalogSnapshot) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for table in snapshot.missing_sections() {
        errors.push(format!(
            "snapshot is missing required array `{}`",
            table.snapshot_key()
        ));
    }
    if snapshot.version.trim().is_empty() {
        warnings.push("snapshot has an empty version string".to_string());
    }

    check_duplicates(snapshot.courses(), &mut errors);
    check_duplicates(snapshot.units(), &mut errors);
    check_duplicates(snapshot.lessons(), &mut errors);
    check_duplicates(snapshot.question_banks(), &mut errors);
    check_duplicates(snapshot.bank_questions(), &mut errors);
    check_duplicates(snapshot.practice_exams(), &mut errors);
    check_duplicates(snapshot.exam_questions(), &mut errors);
    check_duplicates(snapshot.bundles(), &mut errors);
    check_duplicates(snapshot.bundle_courses(), &mut errors);

    check_unknown_fields(snapshot.courses(), &mut warnings);
    check_unknown_fields(snapshot.units(), &mut warnings);
    check_unknown_fields(snapshot.lessons(), &mut warnings);
    check_unknown_fields(snapshot.question_banks(), &mut warnings);
    check_unknown_fields(snapshot.bank_questions(), &mut warnings);
    check_unknown_fields(snapshot.practice_exams(), &mut warnings);
    check_unknown_fields(snapshot.exam_questions(), &mut warnings);
    check_unknown_fields(snapshot.bundles(), &mut warnings);
    check_unknown_fields(snapshot.bundle_courses(), &mut warnings);

    let course_ids = id_set(snapshot.courses());
    let unit_ids = id_set(snapshot.units());
    let bank_ids = id_set(snapshot.question_banks());
    let exam_ids = id_set(snapshot.practice_exams());
    let bundle_ids = id_set(snapshot.bundles());

    for unit in snapshot.units() {
        if !course_ids.contains(&unit.course_id) {
            errors.push(format!(
                "unit {} references unknown course {}",
                unit.id, unit.course_id
            ));
        }
    }
    for lesson in snapshot.lessons() {
        if !unit_ids.contains(&lesson.unit_id) {
            errors.push(format!(
                "lesson {} references unknown unit {}",
                lesson.id, lesson.unit_id
            ));
        }
    }
    for question in snapshot.bank_questions() {
        if !bank_ids.contains(&question.bank_id) {
            errors.push(format!(
                "bank question {} references unknown question bank {}",
                question.id, question.bank_id
            ));
        }
    }
    for question in snapshot.exam_questions() {
        if !exam_ids.contains(&question.exam_id) {
            errors.push(format!(
                "exam question {} references unknown practice exam {}",
                question.id, question.exam_id
            ));
        }
    }
    for link in snapshot.bundle_courses() {
        if !bundle_ids.contains(&link.bundle_id) {
            errors.push(format!(
                "bundle course link {} references unknown bundle {}",
                link.id(),
                link.bundle_id
            ));
        }
        if !course_ids.contains(&link.course_id) {
            errors.push(format!(
                "bundle course link {} references unknown course {}",
                link.id(),
                link.course_id
            ));
        }
    }

    // Optional references: recorded, never blocking.
    for bank in snapshot.question_banks() {
        if let Some(course_id) = bank.course_id.as_deref() {
            if !course_ids.contains(course_id) {
                warnings.push(format!(
                    "question bank {} references unknown course {course_id}",
                    bank.id
                ));
            }
        }
        if let Some(unit_id) = bank.unit_id.as_deref() {
            if !unit_ids.contains(unit_id) {
                warnings.push(format!(
                    "question bank {} references unknown unit {unit_id}",
                    bank.id
                ));
            }
        }
    }
    for exam in snapshot.practice_exams() {
        if let Some(course_id) = exam.course_id.as_deref() {
            if !course_ids.contains(course_id) {
                warnings.push(format!(
                    "practice exam {} references unknown course {course_id}",
                    exam.id
                ));
            }
        }
    }

    ValidationResult {
        ok: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Row counts the snapshot expects to see after import.
pub fn expected_counts(snapshot: &CatalogSnapshot) -> Vec<(Table, usize)> {
    Table::ALL
        .into_iter()
        .map(|table| (table, snapshot.section_len(table)))
        .collect()
}
