//! Exam domain records as stored under `students`, `questions`, `exams`,
//! and `results`.
//!
//! Field names are camelCase on the wire. Extra fields the store stamps
//! onto records (`timestamp`, `lastModified`) are ignored on decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{DomainResult, ExamError};

/// Options per question.
pub const OPTION_COUNT: usize = 4;

/// Minimum percentage counted as a pass.
pub const PASS_MARK: u32 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// Roll number; unique across the roster
    pub student_id: String,
    pub email: String,
    pub grade: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    #[serde(default)]
    pub id: String,
    pub text: String,
    pub options: Vec<String>,
    /// 0-based index into `options`
    pub correct_answer: usize,
    pub difficulty: String,
    pub subject: String,
    pub created_at: DateTime<Utc>,
}

impl Question {
    pub fn is_correct(&self, choice: usize) -> bool {
        choice == self.correct_answer
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exam {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Minutes
    pub duration: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub question_count: usize,
    /// Copies of the sampled questions, frozen at scheduling time
    pub questions: Vec<Question>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamStatus {
    Scheduled,
    Active,
    Ended,
}

impl Exam {
    pub fn status(&self, now: DateTime<Utc>) -> ExamStatus {
        if now < self.start_time {
            ExamStatus::Scheduled
        } else if now > self.end_time {
            ExamStatus::Ended
        } else {
            ExamStatus::Active
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status(now) == ExamStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamResult {
    #[serde(default)]
    pub id: String,
    /// Record id of the student, not the roll number
    pub student_id: String,
    pub student_name: String,
    pub exam_id: String,
    pub exam_title: String,
    pub score: usize,
    pub total_questions: usize,
    pub percentage: u32,
    /// Question index -> chosen option
    #[serde(default)]
    pub answers: BTreeMap<usize, usize>,
    pub completed_at: DateTime<Utc>,
}

impl ExamResult {
    pub fn passed(&self) -> bool {
        self.percentage >= PASS_MARK
    }
}

/// `round(score / total * 100)`, halves rounding up; 0 for an empty exam.
pub fn percentage(score: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    ((score as f64 / total as f64) * 100.0).round() as u32
}

// ── Drafts ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct StudentDraft {
    pub name: String,
    pub student_id: String,
    pub email: String,
    pub grade: String,
}

impl StudentDraft {
    /// Trim every field and reject blanks.
    pub fn validate(self) -> DomainResult<Self> {
        Ok(StudentDraft {
            name: required("name", self.name)?,
            student_id: required("student ID", self.student_id)?,
            email: required("email", self.email)?,
            grade: required("grade", self.grade)?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct QuestionDraft {
    pub text: String,
    pub options: Vec<String>,
    pub correct_answer: usize,
    pub difficulty: String,
    pub subject: String,
}

impl QuestionDraft {
    pub fn validate(self) -> DomainResult<Self> {
        if self.options.len() != OPTION_COUNT {
            return Err(ExamError::OptionCount {
                expected: OPTION_COUNT,
                got: self.options.len(),
            });
        }
        let options = self
            .options
            .into_iter()
            .map(|o| required("option", o))
            .collect::<DomainResult<Vec<_>>>()?;
        if self.correct_answer >= options.len() {
            return Err(ExamError::AnswerOutOfRange {
                index: self.correct_answer,
                options: options.len(),
            });
        }
        Ok(QuestionDraft {
            text: required("question text", self.text)?,
            options,
            correct_answer: self.correct_answer,
            difficulty: required("difficulty", self.difficulty)?,
            subject: required("subject", self.subject)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExamDraft {
    pub title: String,
    pub description: String,
    /// Minutes
    pub duration: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub question_count: usize,
}

impl ExamDraft {
    /// Check the draft against a bank of `available` questions.
    pub fn validate(self, available: usize) -> DomainResult<Self> {
        let title = required("title", self.title)?;
        if self.duration == 0 {
            return Err(ExamError::Missing("duration"));
        }
        if self.question_count == 0 {
            return Err(ExamError::NoQuestions);
        }
        if self.question_count > available {
            return Err(ExamError::NotEnoughQuestions {
                requested: self.question_count,
                available,
            });
        }
        if self.start_time >= self.end_time {
            return Err(ExamError::InvalidWindow);
        }
        Ok(ExamDraft {
            title,
            description: self.description.trim().to_string(),
            ..self
        })
    }
}

fn required(field: &'static str, value: String) -> DomainResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ExamError::Missing(field));
    }
    Ok(trimmed.to_string())
}
