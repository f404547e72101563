use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::options::{IndexOptions, ReturnDocument};
use mongodb::{Collection, Database, IndexModel};
use uuid::Uuid;
use validator::Validate;

use crate::error::LedgerError;
use crate::metrics::LEDGER_RECORDS_TOTAL;
use crate::models::{
    NewScore, NewStudentItem, NewSubmission, Score, StudentItem, StudentItemKey, Submission,
};
use crate::utils::time::to_storage_precision;

const STUDENT_ITEMS: &str = "student_items";
const SUBMISSIONS: &str = "submissions";
const SCORES: &str = "scores";
const COUNTERS: &str = "ledger_counters";

/// Append-only record of what students were asked, what they answered and
/// how it was scored. Consumed by the external scoring workflow.
#[async_trait]
pub trait SubmissionLedger: Send + Sync {
    /// Returns the existing row when the (course, student, item) triple is
    /// already known.
    async fn get_or_create_student_item(
        &self,
        item: NewStudentItem,
    ) -> Result<StudentItem, LedgerError>;

    async fn get_student_item(
        &self,
        key: &StudentItemKey,
    ) -> Result<Option<StudentItem>, LedgerError>;

    async fn create_submission(&self, submission: NewSubmission)
        -> Result<Submission, LedgerError>;

    async fn create_score(&self, score: NewScore) -> Result<Score, LedgerError>;

    /// Most recent by `submitted_at`, then by insertion order.
    async fn latest_submission(
        &self,
        student_item_id: &str,
    ) -> Result<Option<Submission>, LedgerError>;

    /// Most recently created row; insertion order breaks same-millisecond
    /// ties.
    async fn latest_score(&self, student_item_id: &str) -> Result<Option<Score>, LedgerError>;

    /// Newest `submitted_at` first.
    async fn list_submissions(&self, student_item_id: &str)
        -> Result<Vec<Submission>, LedgerError>;
}

pub struct MongoLedger {
    mongo: Database,
}

impl MongoLedger {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }

    fn student_items(&self) -> Collection<StudentItem> {
        self.mongo.collection(STUDENT_ITEMS)
    }

    fn submissions(&self) -> Collection<Submission> {
        self.mongo.collection(SUBMISSIONS)
    }

    fn scores(&self) -> Collection<Score> {
        self.mongo.collection(SCORES)
    }

    /// Create the unique triple index and the lookup indexes. Safe to call
    /// on every startup.
    pub async fn ensure_indexes(&self) -> Result<(), LedgerError> {
        self.student_items()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "course_id": 1, "student_id": 1, "item_id": 1 })
                    .options(
                        IndexOptions::builder()
                            .unique(true)
                            .name("student_item_unique".to_string())
                            .build(),
                    )
                    .build(),
            )
            .await?;

        self.submissions()
            .create_index(
                IndexModel::builder()
                    .keys(lookup_index_keys(submission_order()))
                    .build(),
            )
            .await?;

        self.scores()
            .create_index(
                IndexModel::builder()
                    .keys(lookup_index_keys(score_order()))
                    .build(),
            )
            .await?;

        tracing::info!("Submission ledger indexes ensured");
        Ok(())
    }

    fn counters(&self) -> Collection<Document> {
        self.mongo.collection(COUNTERS)
    }

    /// Next value of a named counter shared by every process writing to
    /// this database.
    async fn next_seq(&self, counter: &str) -> Result<i64, LedgerError> {
        let counters = self.counters();
        let counters = &counters;
        let increment = move || {
            counters
                .find_one_and_update(doc! { "_id": counter }, doc! { "$inc": { "seq": 1_i64 } })
                .upsert(true)
                .return_document(ReturnDocument::After)
        };

        let updated = match increment().await {
            Ok(updated) => updated,
            // Two processes created the counter at once; it exists now.
            Err(e) if is_duplicate_key(&e) => increment().await?,
            Err(e) => return Err(e.into()),
        };

        updated
            .and_then(|counter_doc| counter_doc.get_i64("seq").ok())
            .ok_or_else(|| LedgerError::Sequence(counter.to_string()))
    }

    async fn require_student_item(&self, student_item_id: &str) -> Result<(), LedgerError> {
        self.student_items()
            .find_one(doc! { "_id": student_item_id })
            .await?
            .map(|_| ())
            .ok_or_else(|| LedgerError::StudentItemNotFound(student_item_id.to_string()))
    }
}

#[async_trait]
impl SubmissionLedger for MongoLedger {
    async fn get_or_create_student_item(
        &self,
        item: NewStudentItem,
    ) -> Result<StudentItem, LedgerError> {
        item.validate()?;
        let key = item.key();

        let filter = doc! {
            "course_id": &item.course_id,
            "student_id": &item.student_id,
            "item_id": &item.item_id,
        };
        let update = doc! {
            "$setOnInsert": {
                "_id": Uuid::new_v4().to_string(),
                "item_type": &item.item_type,
            }
        };

        let result = self
            .student_items()
            .find_one_and_update(filter, update)
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await;

        match result {
            Ok(Some(student_item)) => Ok(student_item),
            Ok(None) => self.get_student_item(&key).await?.ok_or_else(|| {
                LedgerError::StudentItemNotFound(format!("{:?}", key))
            }),
            // Two concurrent upserts on the same triple: the loser hits the
            // unique index and reads the winner's row.
            Err(e) if is_duplicate_key(&e) => {
                tracing::debug!("Student item upsert raced, re-reading: {:?}", key);
                self.get_student_item(&key)
                    .await?
                    .ok_or_else(|| LedgerError::StudentItemNotFound(format!("{:?}", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_student_item(
        &self,
        key: &StudentItemKey,
    ) -> Result<Option<StudentItem>, LedgerError> {
        Ok(self
            .student_items()
            .find_one(doc! {
                "course_id": &key.course_id,
                "student_id": &key.student_id,
                "item_id": &key.item_id,
            })
            .await?)
    }

    async fn create_submission(
        &self,
        submission: NewSubmission,
    ) -> Result<Submission, LedgerError> {
        self.require_student_item(&submission.student_item_id)
            .await?;

        let seq = self.next_seq(SUBMISSIONS).await?;
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

        self.submissions().insert_one(&record).await?;
        LEDGER_RECORDS_TOTAL.with_label_values(&["submission"]).inc();

        tracing::info!(
            submission_id = %record.id,
            student_item_id = %record.student_item_id,
            attempt_number = record.attempt_number,
            "Submission recorded"
        );
        Ok(record)
    }

    async fn create_score(&self, score: NewScore) -> Result<Score, LedgerError> {
        self.require_student_item(&score.student_item_id).await?;

        if let Some(submission_id) = &score.submission_id {
            let submission = self
                .submissions()
                .find_one(doc! { "_id": submission_id })
                .await?;
            if submission.map(|s| s.student_item_id) != Some(score.student_item_id.clone()) {
                return Err(LedgerError::SubmissionMismatch {
                    submission_id: submission_id.clone(),
                    student_item_id: score.student_item_id,
                });
            }
        }

        let seq = self.next_seq(SCORES).await?;
        let record = Score {
            id: Uuid::new_v4().to_string(),
            student_item_id: score.student_item_id,
            submission_id: score.submission_id,
            points_earned: score.points_earned,
            points_possible: score.points_possible,
            created_at: to_storage_precision(Utc::now()),
            seq,
        };

        self.scores().insert_one(&record).await?;
        LEDGER_RECORDS_TOTAL.with_label_values(&["score"]).inc();

        tracing::info!(
            score_id = %record.id,
            student_item_id = %record.student_item_id,
            points_earned = record.points_earned,
            points_possible = record.points_possible,
            "Score recorded"
        );
        Ok(record)
    }

    async fn latest_submission(
        &self,
        student_item_id: &str,
    ) -> Result<Option<Submission>, LedgerError> {
        Ok(self
            .submissions()
            .find_one(doc! { "student_item_id": student_item_id })
            .sort(submission_order())
            .await?)
    }

    async fn latest_score(&self, student_item_id: &str) -> Result<Option<Score>, LedgerError> {
        Ok(self
            .scores()
            .find_one(doc! { "student_item_id": student_item_id })
            .sort(score_order())
            .await?)
    }

    async fn list_submissions(
        &self,
        student_item_id: &str,
    ) -> Result<Vec<Submission>, LedgerError> {
        let cursor = self
            .submissions()
            .find(doc! { "student_item_id": student_item_id })
            .sort(submission_order())
            .await?;

        Ok(cursor.try_collect().await?)
    }
}

/// Newest first. `seq` decides between rows with the same millisecond.
fn submission_order() -> Document {
    doc! { "submitted_at": -1, "seq": -1 }
}

fn score_order() -> Document {
    doc! { "seq": -1 }
}

/// Per-student-item lookup index serving one of the orderings above.
fn lookup_index_keys(order: Document) -> Document {
    let mut keys = doc! { "student_item_id": 1 };
    keys.extend(order);
    keys
}

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};

    match error.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
        ErrorKind::Command(command_error) => command_error.code == 11000,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_names(document: &Document) -> Vec<&str> {
        document.keys().map(String::as_str).collect()
    }

    #[test]
    fn test_orderings_break_ties_on_seq() {
        assert_eq!(key_names(&submission_order()), ["submitted_at", "seq"]);
        assert_eq!(key_names(&score_order()), ["seq"]);
        assert_eq!(submission_order().get_i32("seq").unwrap(), -1);
        assert_eq!(score_order().get_i32("seq").unwrap(), -1);
    }

    #[test]
    fn test_lookup_indexes_cover_sorts() {
        assert_eq!(
            key_names(&lookup_index_keys(submission_order())),
            ["student_item_id", "submitted_at", "seq"]
        );
        assert_eq!(
            key_names(&lookup_index_keys(score_order())),
            ["student_item_id", "seq"]
        );
    }
}
