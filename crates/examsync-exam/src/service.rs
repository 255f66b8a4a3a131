//! Exam management on top of a [`SyncStore`].
//!
//! Every mutation goes through the store, so it works offline and reports
//! whether the remote has acknowledged it.

use chrono::{DateTime, Utc};
use examsync_core::{Ack, RecordPath};
use examsync_sync::SyncStore;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::error::{DomainResult, ExamError};
use crate::model::{Exam, ExamDraft, ExamResult, Question, QuestionDraft, Student, StudentDraft};
use crate::report::{Dashboard, ResultFilter};
use crate::sampling::sample;
use crate::session::ExamSession;

pub const STUDENTS: &str = "students";
pub const QUESTIONS: &str = "questions";
pub const EXAMS: &str = "exams";
pub const RESULTS: &str = "results";

/// A freshly stored record and how far it got.
#[derive(Debug, Clone)]
pub struct Saved<T> {
    pub record: T,
    pub ack: Ack,
}

pub struct ExamService {
    store: SyncStore,
    rng: Mutex<StdRng>,
}

impl ExamService {
    pub fn new(store: SyncStore) -> Self {
        Self::with_rng(store, StdRng::from_entropy())
    }

    /// Use a fixed random source, for reproducible question sampling.
    pub fn with_rng(store: SyncStore, rng: StdRng) -> Self {
        ExamService {
            store,
            rng: Mutex::new(rng),
        }
    }

    pub fn store(&self) -> &SyncStore {
        &self.store
    }

    // ── Students ────────────────────────────────────────────────────────────

    pub async fn students(&self) -> DomainResult<Vec<Student>> {
        let mut all: Vec<Student> = self.load(STUDENTS).await?;
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    pub async fn add_student(&self, draft: StudentDraft) -> DomainResult<Saved<Student>> {
        let draft = draft.validate()?;
        if self
            .students()
            .await?
            .iter()
            .any(|s| s.student_id == draft.student_id)
        {
            return Err(ExamError::DuplicateStudentId(draft.student_id));
        }
        let student = Student {
            id: String::new(),
            name: draft.name,
            student_id: draft.student_id,
            email: draft.email,
            grade: draft.grade,
            created_at: Utc::now(),
        };
        let saved = self.append(STUDENTS, student).await?;
        info!(id = %saved.record.id, roll = %saved.record.student_id, ack = ?saved.ack, "student added");
        Ok(saved)
    }

    pub async fn remove_student(&self, id: &str) -> DomainResult<Ack> {
        self.remove(STUDENTS, id).await
    }

    // ── Questions ───────────────────────────────────────────────────────────

    pub async fn questions(&self) -> DomainResult<Vec<Question>> {
        let mut all: Vec<Question> = self.load(QUESTIONS).await?;
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    pub async fn add_question(&self, draft: QuestionDraft) -> DomainResult<Saved<Question>> {
        let draft = draft.validate()?;
        let question = Question {
            id: String::new(),
            text: draft.text,
            options: draft.options,
            correct_answer: draft.correct_answer,
            difficulty: draft.difficulty,
            subject: draft.subject,
            created_at: Utc::now(),
        };
        let saved = self.append(QUESTIONS, question).await?;
        info!(id = %saved.record.id, subject = %saved.record.subject, ack = ?saved.ack, "question added");
        Ok(saved)
    }

    pub async fn remove_question(&self, id: &str) -> DomainResult<Ack> {
        self.remove(QUESTIONS, id).await
    }

    // ── Exams ───────────────────────────────────────────────────────────────

    pub async fn exams(&self) -> DomainResult<Vec<Exam>> {
        let mut all: Vec<Exam> = self.load(EXAMS).await?;
        all.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(all)
    }

    /// Schedule an exam over a random sample of the current bank.
    pub async fn create_exam(&self, draft: ExamDraft) -> DomainResult<Saved<Exam>> {
        let bank = self.questions().await?;
        let draft = draft.validate(bank.len())?;
        let questions = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            sample(&bank, draft.question_count, &mut *rng)
        };
        let exam = Exam {
            id: String::new(),
            title: draft.title,
            description: draft.description,
            duration: draft.duration,
            start_time: draft.start_time,
            end_time: draft.end_time,
            question_count: draft.question_count,
            questions,
            created_at: Utc::now(),
        };
        let saved = self.append(EXAMS, exam).await?;
        info!(
            id = %saved.record.id,
            questions = saved.record.question_count,
            ack = ?saved.ack,
            "exam scheduled"
        );
        Ok(saved)
    }

    pub async fn remove_exam(&self, id: &str) -> DomainResult<Ack> {
        self.remove(EXAMS, id).await
    }

    // ── Sessions and results ────────────────────────────────────────────────

    /// Open a session for `student_id` (record id) on `exam_id`.
    pub async fn start_session(
        &self,
        exam_id: &str,
        student_id: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<ExamSession> {
        let exam = self
            .exams()
            .await?
            .into_iter()
            .find(|e| e.id == exam_id)
            .ok_or_else(|| ExamError::UnknownExam(exam_id.to_string()))?;
        let student = self
            .students()
            .await?
            .into_iter()
            .find(|s| s.id == student_id)
            .ok_or_else(|| ExamError::UnknownStudent(student_id.to_string()))?;
        ExamSession::start(exam, student, now)
    }

    /// Score `session` and store the result.
    pub async fn submit(
        &self,
        session: ExamSession,
        now: DateTime<Utc>,
    ) -> DomainResult<Saved<ExamResult>> {
        let result = session.finish(now);
        let saved = self.append(RESULTS, result).await?;
        info!(
            exam = %saved.record.exam_id,
            student = %saved.record.student_id,
            score = saved.record.score,
            total = saved.record.total_questions,
            ack = ?saved.ack,
            "result recorded"
        );
        Ok(saved)
    }

    pub async fn results(&self, filter: &ResultFilter) -> DomainResult<Vec<ExamResult>> {
        let mut all: Vec<ExamResult> = self.load(RESULTS).await?;
        all.retain(|r| filter.matches(r));
        all.sort_by(|a, b| a.completed_at.cmp(&b.completed_at));
        Ok(all)
    }

    pub async fn dashboard(&self, now: DateTime<Utc>) -> DomainResult<Dashboard> {
        let students = self.students().await?.len();
        let questions = self.questions().await?.len();
        let exams = self.exams().await?;
        let results = self.results(&ResultFilter::default()).await?;
        Ok(Dashboard::compute(students, questions, &exams, &results, now))
    }

    // ── Store plumbing ──────────────────────────────────────────────────────

    /// Decode every child of `collection`. An absent collection is empty;
    /// children that fail to decode are skipped.
    async fn load<T: DeserializeOwned>(&self, collection: &str) -> DomainResult<Vec<T>> {
        let path = RecordPath::parse(collection)?;
        let Some(Value::Object(children)) = self.store.read(&path).await else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(children.len());
        for (key, value) in children {
            match serde_json::from_value::<T>(with_id(value, &key)) {
                Ok(item) => out.push(item),
                Err(e) => warn!(collection, key = %key, error = %e, "skipping undecodable record"),
            }
        }
        debug!(collection, count = out.len(), "collection loaded");
        Ok(out)
    }

    async fn append<T>(&self, collection: &str, record: T) -> DomainResult<Saved<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let path = RecordPath::parse(collection)?;
        let value = serde_json::to_value(&record)
            .map_err(|e| ExamError::Encode(format!("{collection} record: {e}")))?;
        let appended = self.store.append(&path, without_id(value)).await?;
        let stored = self
            .store
            .read(&path.child(&appended.id)?)
            .await
            .map(|v| with_id(v, &appended.id));
        let record = match stored.map(serde_json::from_value::<T>) {
            Some(Ok(r)) => r,
            _ => set_id(record, &appended.id)?,
        };
        Ok(Saved {
            record,
            ack: appended.ack,
        })
    }

    async fn remove(&self, collection: &str, id: &str) -> DomainResult<Ack> {
        let path = RecordPath::parse(collection)?.child(id)?;
        let ack = self.store.remove(&path).await?;
        info!(path = %path, ack = ?ack, "record removed");
        Ok(ack)
    }
}

/// The store key is the record's identity; fill `id` from it.
fn with_id(mut value: Value, key: &str) -> Value {
    if let Some(obj) = value.as_object_mut() {
        obj.insert("id".into(), Value::String(key.to_string()));
    }
    value
}

fn without_id(mut value: Value) -> Value {
    if let Some(obj) = value.as_object_mut() {
        obj.remove("id");
    }
    value
}

fn set_id<T: Serialize + DeserializeOwned>(record: T, id: &str) -> DomainResult<T> {
    let value = serde_json::to_value(record)
        .map_err(|e| ExamError::Encode(e.to_string()))?;
    serde_json::from_value(with_id(value, id))
        .map_err(|e| ExamError::Encode(e.to_string()))
}
