use std::cmp::Reverse;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;
use validator::Validate;

use crate::error::LedgerError;
use crate::metrics::LEDGER_RECORDS_TOTAL;
use crate::models::{
    NewScore, NewStudentItem, NewSubmission, Score, StudentItem, StudentItemKey, Submission,
};
use crate::services::submission_service::SubmissionLedger;
use crate::utils::time::to_storage_precision;

#[derive(Default)]
struct LedgerRows {
    student_items: Vec<StudentItem>,
    submissions: Vec<Submission>,
    scores: Vec<Score>,
    last_seq: i64,
}

impl LedgerRows {
    fn next_seq(&mut self) -> i64 {
        self.last_seq += 1;
        self.last_seq
    }
}

/// In-process ledger with the same semantics as [`MongoLedger`]. Used by
/// tests and by single-process development setups.
///
/// [`MongoLedger`]: crate::services::submission_service::MongoLedger
#[derive(Default)]
pub struct MemoryLedger {
    rows: RwLock<LedgerRows>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn student_item_count(&self) -> usize {
        self.rows.read().await.student_items.len()
    }
}

fn matches_key(item: &StudentItem, key: &StudentItemKey) -> bool {
    item.course_id == key.course_id && item.student_id == key.student_id && item.item_id == key.item_id
}

#[async_trait]
impl SubmissionLedger for MemoryLedger {
    async fn get_or_create_student_item(
        &self,
        item: NewStudentItem,
    ) -> Result<StudentItem, LedgerError> {
        item.validate()?;
        let key = item.key();

        // Check and insert under one write lock so concurrent callers collapse
        // onto a single row.
        let mut rows = self.rows.write().await;
        if let Some(existing) = rows.student_items.iter().find(|i| matches_key(i, &key)) {
            return Ok(existing.clone());
        }

        let student_item = StudentItem {
            id: Uuid::new_v4().to_string(),
            student_id: item.student_id,
            course_id: item.course_id,
            item_id: item.item_id,
            item_type: item.item_type,
        };
        rows.student_items.push(student_item.clone());
        Ok(student_item)
    }

    async fn get_student_item(
        &self,
        key: &StudentItemKey,
    ) -> Result<Option<StudentItem>, LedgerError> {
        let rows = self.rows.read().await;
        Ok(rows
            .student_items
            .iter()
            .find(|i| matches_key(i, key))
            .cloned())
    }

    async fn create_submission(
        &self,
        submission: NewSubmission,
    ) -> Result<Submission, LedgerError> {
        let mut rows = self.rows.write().await;
        if !rows
            .student_items
            .iter()
            .any(|i| i.id == submission.student_item_id)
        {
            return Err(LedgerError::StudentItemNotFound(submission.student_item_id));
        }

        let seq = rows.next_seq();
        let created_at = to_storage_precision(Utc::now());
        let record = Submission {
            id: Uuid::new_v4().to_string(),
            student_item_id: submission.student_item_id,
            attempt_number: submission.attempt_number,
            submitted_at: to_storage_precision(submission.submitted_at.unwrap_or(created_at)),
            created_at,
            seq,
            answer: submission.answer,
        };
        rows.submissions.push(record.clone());
        LEDGER_RECORDS_TOTAL.with_label_values(&["submission"]).inc();

        Ok(record)
    }

    async fn create_score(&self, score: NewScore) -> Result<Score, LedgerError> {
        let mut rows = self.rows.write().await;
        if !rows.student_items.iter().any(|i| i.id == score.student_item_id) {
            return Err(LedgerError::StudentItemNotFound(score.student_item_id));
        }

        if let Some(submission_id) = &score.submission_id {
            let belongs = rows
                .submissions
                .iter()
                .any(|s| &s.id == submission_id && s.student_item_id == score.student_item_id);
            if !belongs {
                return Err(LedgerError::SubmissionMismatch {
                    submission_id: submission_id.clone(),
                    student_item_id: score.student_item_id,
                });
            }
        }

        let seq = rows.next_seq();
        let record = Score {
            id: Uuid::new_v4().to_string(),
            student_item_id: score.student_item_id,
            submission_id: score.submission_id,
            points_earned: score.points_earned,
            points_possible: score.points_possible,
            created_at: to_storage_precision(Utc::now()),
            seq,
        };
        rows.scores.push(record.clone());
        LEDGER_RECORDS_TOTAL.with_label_values(&["score"]).inc();

        Ok(record)
    }

    async fn latest_submission(
        &self,
        student_item_id: &str,
    ) -> Result<Option<Submission>, LedgerError> {
        let rows = self.rows.read().await;
        Ok(rows
            .submissions
            .iter()
            .filter(|s| s.student_item_id == student_item_id)
            .max_by_key(|s| (s.submitted_at, s.seq))
            .cloned())
    }

    async fn latest_score(&self, student_item_id: &str) -> Result<Option<Score>, LedgerError> {
        let rows = self.rows.read().await;
        Ok(rows
            .scores
            .iter()
            .filter(|s| s.student_item_id == student_item_id)
            .max_by_key(|s| s.seq)
            .cloned())
    }

    async fn list_submissions(
        &self,
        student_item_id: &str,
    ) -> Result<Vec<Submission>, LedgerError> {
        let rows = self.rows.read().await;
        let mut submissions: Vec<Submission> = rows
            .submissions
            .iter()
            .filter(|s| s.student_item_id == student_item_id)
            .cloned()
            .collect();
        submissions.sort_by_key(|s| Reverse((s.submitted_at, s.seq)));
        Ok(submissions)
    }
}
