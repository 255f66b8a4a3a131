use chrono::{DateTime, Utc};
use examsync_core::SyncError;
use thiserror::Error;

pub type DomainResult<T> = Result<T, ExamError>;

#[derive(Debug, Error)]
pub enum ExamError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("student ID {0} is already registered")]
    DuplicateStudentId(String),

    #[error("a question needs exactly {expected} options, got {got}")]
    OptionCount { expected: usize, got: usize },

    #[error("answer index {index} is out of range for {options} options")]
    AnswerOutOfRange { index: usize, options: usize },

    #[error("exam must start before it ends")]
    InvalidWindow,

    #[error("exam needs at least one question")]
    NoQuestions,

    #[error("requested {requested} questions but the bank holds {available}")]
    NotEnoughQuestions { requested: usize, available: usize },

    #[error("exam opens at {0}")]
    NotStarted(DateTime<Utc>),

    #[error("exam closed at {0}")]
    Ended(DateTime<Utc>),

    #[error("time ran out at {0}")]
    TimeUp(DateTime<Utc>),

    #[error("no student with id {0}")]
    UnknownStudent(String),

    #[error("no exam with id {0}")]
    UnknownExam(String),

    #[error("record encoding failed: {0}")]
    Encode(String),

    #[error("export failed: {0}")]
    Export(String),

    #[error(transparent)]
    Sync(#[from] SyncError),
}
