//! One student sitting one exam.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

use crate::error::{DomainResult, ExamError};
use crate::model::{percentage, Exam, ExamResult, Question, Student};

#[derive(Debug, Clone)]
pub struct ExamSession {
    exam: Exam,
    student: Student,
    started_at: DateTime<Utc>,
    current: usize,
    answers: BTreeMap<usize, usize>,
}

impl ExamSession {
    /// Open a session. Fails outside the exam window.
    pub fn start(exam: Exam, student: Student, now: DateTime<Utc>) -> DomainResult<Self> {
        if now < exam.start_time {
            return Err(ExamError::NotStarted(exam.start_time));
        }
        if now > exam.end_time {
            return Err(ExamError::Ended(exam.end_time));
        }
        tracing::info!(exam = %exam.id, student = %student.id, "exam session started");
        Ok(ExamSession {
            exam,
            student,
            started_at: now,
            current: 0,
            answers: BTreeMap::new(),
        })
    }

    pub fn exam(&self) -> &Exam {
        &self.exam
    }

    pub fn student(&self) -> &Student {
        &self.student
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Earlier of `started + duration` and the exam's end time.
    pub fn deadline(&self) -> DateTime<Utc> {
        let by_duration = self.started_at + Duration::minutes(i64::from(self.exam.duration));
        by_duration.min(self.exam.end_time)
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.deadline() - now).max(Duration::zero())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline()
    }

    pub fn position(&self) -> usize {
        self.current
    }

    pub fn total(&self) -> usize {
        self.exam.questions.len()
    }

    pub fn current_question(&self) -> Option<&Question> {
        self.exam.questions.get(self.current)
    }

    pub fn is_last(&self) -> bool {
        self.current + 1 >= self.total()
    }

    /// Record `choice` for the current question, replacing any earlier one.
    /// Refused once the deadline has passed.
    pub fn answer(&mut self, choice: usize, now: DateTime<Utc>) -> DomainResult<()> {
        if self.is_expired(now) {
            return Err(ExamError::TimeUp(self.deadline()));
        }
        let options = self
            .current_question()
            .map(|q| q.options.len())
            .ok_or(ExamError::NoQuestions)?;
        if choice >= options {
            return Err(ExamError::AnswerOutOfRange {
                index: choice,
                options,
            });
        }
        self.answers.insert(self.current, choice);
        Ok(())
    }

    pub fn answer_for(&self, index: usize) -> Option<usize> {
        self.answers.get(&index).copied()
    }

    /// Move forward; false at the last question.
    pub fn next(&mut self) -> bool {
        if self.is_last() {
            return false;
        }
        self.current += 1;
        true
    }

    /// Move back; false at the first question.
    pub fn prev(&mut self) -> bool {
        if self.current == 0 {
            return false;
        }
        self.current -= 1;
        true
    }

    /// Score the session. Unanswered questions count as wrong. A session
    /// finished late is recorded as completed at its deadline.
    pub fn finish(self, now: DateTime<Utc>) -> ExamResult {
        let completed_at = now.min(self.deadline());
        let score = self
            .exam
            .questions
            .iter()
            .enumerate()
            .filter(|(i, q)| self.answers.get(i).is_some_and(|c| q.is_correct(*c)))
            .count();
        let total = self.total();
        ExamResult {
            id: String::new(),
            student_id: self.student.id,
            student_name: self.student.name,
            exam_id: self.exam.id,
            exam_title: self.exam.title,
            score,
            total_questions: total,
            percentage: percentage(score, total),
            answers: self.answers,
            completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn question(id: &str, correct: usize) -> Question {
        Question {
            id: id.into(),
            text: format!("question {id}"),
            options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            correct_answer: correct,
            difficulty: "easy".into(),
            subject: "math".into(),
            created_at: t(0, 0),
        }
    }

    fn exam(duration: u32) -> Exam {
        Exam {
            id: "e1".into(),
            title: "Midterm".into(),
            description: String::new(),
            duration,
            start_time: t(9, 0),
            end_time: t(10, 0),
            question_count: 3,
            questions: vec![question("q1", 0), question("q2", 1), question("q3", 2)],
            created_at: t(8, 0),
        }
    }

    fn student() -> Student {
        Student {
            id: "s1".into(),
            name: "Ali".into(),
            student_id: "S-1".into(),
            email: "ali@example.com".into(),
            grade: "10".into(),
            created_at: t(0, 0),
        }
    }

    #[test]
    fn refuses_outside_window() {
        assert!(matches!(
            ExamSession::start(exam(30), student(), t(8, 59)).unwrap_err(),
            ExamError::NotStarted(_)
        ));
        assert!(matches!(
            ExamSession::start(exam(30), student(), t(10, 1)).unwrap_err(),
            ExamError::Ended(_)
        ));
    }

    #[test]
    fn deadline_is_capped_by_end_time() {
        let s = ExamSession::start(exam(30), student(), t(9, 0)).unwrap();
        assert_eq!(s.deadline(), t(9, 30));
        let late = ExamSession::start(exam(30), student(), t(9, 45)).unwrap();
        assert_eq!(late.deadline(), t(10, 0));
        assert_eq!(late.remaining(t(9, 50)), Duration::minutes(10));
        assert!(late.is_expired(t(10, 0)));
        assert_eq!(late.remaining(t(11, 0)), Duration::zero());
    }

    #[test]
    fn navigation_stays_in_bounds() {
        let mut s = ExamSession::start(exam(30), student(), t(9, 0)).unwrap();
        assert!(!s.prev());
        assert!(s.next());
        assert!(s.next());
        assert!(s.is_last());
        assert!(!s.next());
        assert_eq!(s.current_question().unwrap().id, "q3");
        assert!(s.prev());
        assert_eq!(s.position(), 1);
    }

    #[test]
    fn scoring_counts_correct_answers() {
        let mut s = ExamSession::start(exam(30), student(), t(9, 0)).unwrap();
        s.answer(0, t(9, 5)).unwrap(); // q1 correct
        s.next();
        s.answer(3, t(9, 6)).unwrap(); // q2 wrong
        s.answer(1, t(9, 7)).unwrap(); // changed: q2 correct
        s.next();
        // q3 unanswered
        assert!(s.answer(4, t(9, 8)).is_err());

        let r = s.finish(t(9, 20));
        assert_eq!(r.score, 2);
        assert_eq!(r.total_questions, 3);
        assert_eq!(r.percentage, 67);
        assert!(r.passed());
        assert_eq!(r.answers.len(), 2);
        assert_eq!(r.student_name, "Ali");
        assert_eq!(r.exam_title, "Midterm");
    }

    #[test]
    fn answers_after_deadline_are_refused() {
        let mut s = ExamSession::start(exam(30), student(), t(9, 0)).unwrap();
        s.answer(0, t(9, 29)).unwrap();
        s.next();
        let err = s.answer(1, t(9, 30)).unwrap_err();
        assert!(matches!(err, ExamError::TimeUp(d) if d == t(9, 30)));
        assert_eq!(s.answer_for(1), None);

        let r = s.finish(t(9, 45));
        assert_eq!(r.score, 1);
        assert_eq!(r.completed_at, t(9, 30));
    }
}
