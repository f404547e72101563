pub mod submission;

pub use submission::{
    NewScore, NewStudentItem, NewSubmission, Score, StudentItem, StudentItemKey, Submission,
};
