//! Student items, submissions and scores.
//!
//! All three are append-only. A student item is unique per
//! (course, student, item); submissions and scores are never updated, a new
//! score row is how rescoring is recorded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::utils::time::bson_datetime_as_chrono;

/// Identifies one piece of content for one student in one course.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StudentItemKey {
    pub course_id: String,
    pub student_id: String,
    pub item_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentItem {
    #[serde(rename = "_id")]
    pub id: String,
    /// The anonymized student id the content sees, not the real one.
    pub student_id: String,
    pub course_id: String,
    pub item_id: String,
    /// What kind of problem this is, e.g. the block type.
    pub item_type: String,
}

impl StudentItem {
    pub fn key(&self) -> StudentItemKey {
        StudentItemKey {
            course_id: self.course_id.clone(),
            student_id: self.student_id.clone(),
            item_id: self.item_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewStudentItem {
    #[validate(length(
        min = 1,
        max = 255,
        message = "student_id must be between 1 and 255 characters"
    ))]
    pub student_id: String,

    #[validate(length(
        min = 1,
        max = 255,
        message = "course_id must be between 1 and 255 characters"
    ))]
    pub course_id: String,

    #[validate(length(
        min = 1,
        max = 255,
        message = "item_id must be between 1 and 255 characters"
    ))]
    pub item_id: String,

    #[validate(length(max = 100, message = "item_type must be at most 100 characters"))]
    pub item_type: String,
}

impl NewStudentItem {
    pub fn key(&self) -> StudentItemKey {
        StudentItemKey {
            course_id: self.course_id.clone(),
            student_id: self.student_id.clone(),
            item_id: self.item_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    #[serde(rename = "_id")]
    pub id: String,
    pub student_item_id: String,
    /// Not necessarily increasing with time: rescoring may backfill attempts.
    pub attempt_number: u32,
    /// When the student acted, as opposed to when the row was written.
    #[serde(with = "bson_datetime_as_chrono")]
    pub submitted_at: DateTime<Utc>,
    #[serde(with = "bson_datetime_as_chrono")]
    pub created_at: DateTime<Utc>,
    /// Ledger-wide insertion order. Stored times only keep milliseconds, so
    /// this orders rows written within the same millisecond.
    #[serde(default)]
    pub seq: i64,
    /// Opaque serialized answer, usually JSON text.
    pub answer: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSubmission {
    pub student_item_id: String,
    pub attempt_number: u32,
    /// Defaults to the creation time.
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    #[serde(rename = "_id")]
    pub id: String,
    pub student_item_id: String,
    /// `None` means "best known score", not tied to one submission.
    pub submission_id: Option<String>,
    pub points_earned: u32,
    pub points_possible: u32,
    #[serde(with = "bson_datetime_as_chrono")]
    pub created_at: DateTime<Utc>,
    /// Ledger-wide insertion order; the highest value is the current score.
    #[serde(default)]
    pub seq: i64,
}

/// `points_earned` is not checked against `points_possible`; that is the
/// scoring workflow's call.
#[derive(Debug, Clone, Deserialize)]
pub struct NewScore {
    pub student_item_id: String,
    pub submission_id: Option<String>,
    pub points_earned: u32,
    pub points_possible: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_item(student_id: &str, item_type: &str) -> NewStudentItem {
        NewStudentItem {
            student_id: student_id.to_string(),
            course_id: "course-1".to_string(),
            item_id: "problem-7".to_string(),
            item_type: item_type.to_string(),
        }
    }

    #[test]
    fn test_valid_student_item() {
        assert!(new_item("student-1", "openassessment").validate().is_ok());
        assert!(new_item("student-1", "").validate().is_ok());
    }

    #[test]
    fn test_blank_ids_rejected() {
        let errors = new_item("", "problem").validate().unwrap_err();
        assert!(errors.field_errors().contains_key("student_id"));
    }

    #[test]
    fn test_long_item_type_rejected() {
        let errors = new_item("student-1", &"x".repeat(101)).validate().unwrap_err();
        assert!(errors.field_errors().contains_key("item_type"));
    }
}
