//! examsync-exam: student roster, question bank, exam scheduling, sessions,
//! and results, stored through the offline-tolerant sync store

pub mod error;
pub mod model;
pub mod report;
pub mod sampling;
pub mod service;
pub mod session;

pub use error::{DomainResult, ExamError};
pub use model::{
    Exam, ExamDraft, ExamResult, ExamStatus, Question, QuestionDraft, Student, StudentDraft,
};
pub use report::{Dashboard, ResultFilter};
pub use service::{ExamService, Saved};
pub use session::ExamSession;
