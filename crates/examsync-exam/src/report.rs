//! Result filtering, dashboard figures, and CSV export.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{DomainResult, ExamError};
use crate::model::{Exam, ExamResult};

/// Narrow a result list; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ResultFilter {
    pub exam_id: Option<String>,
    pub student_id: Option<String>,
}

impl ResultFilter {
    pub fn matches(&self, r: &ExamResult) -> bool {
        self.exam_id.as_ref().map_or(true, |id| *id == r.exam_id)
            && self.student_id.as_ref().map_or(true, |id| *id == r.student_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dashboard {
    pub total_students: usize,
    pub total_questions: usize,
    pub active_exams: usize,
    pub total_results: usize,
    /// Rounded mean percentage; `None` with no results
    pub average_percentage: Option<u32>,
}

impl Dashboard {
    pub fn compute(
        students: usize,
        questions: usize,
        exams: &[Exam],
        results: &[ExamResult],
        now: DateTime<Utc>,
    ) -> Self {
        let average_percentage = (!results.is_empty()).then(|| {
            let sum: u64 = results.iter().map(|r| u64::from(r.percentage)).sum();
            (sum as f64 / results.len() as f64).round() as u32
        });
        Dashboard {
            total_students: students,
            total_questions: questions,
            active_exams: exams.iter().filter(|e| e.is_active(now)).count(),
            total_results: results.len(),
            average_percentage,
        }
    }
}

#[derive(Serialize)]
struct CsvRow<'a> {
    student: &'a str,
    exam: &'a str,
    score: usize,
    total_questions: usize,
    percentage: String,
    completed_at: String,
    status: &'static str,
}

/// Render results as CSV with a header row.
pub fn results_csv(results: &[ExamResult]) -> DomainResult<String> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    for r in results {
        wtr.serialize(CsvRow {
            student: &r.student_name,
            exam: &r.exam_title,
            score: r.score,
            total_questions: r.total_questions,
            percentage: format!("{}%", r.percentage),
            completed_at: r.completed_at.to_rfc3339(),
            status: if r.passed() { "pass" } else { "fail" },
        })
        .map_err(|e| ExamError::Export(e.to_string()))?;
    }
    let bytes = wtr
        .into_inner()
        .map_err(|e| ExamError::Export(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| ExamError::Export(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn result(student: &str, exam: &str, pct: u32) -> ExamResult {
        ExamResult {
            id: format!("{student}-{exam}"),
            student_id: student.into(),
            student_name: format!("Name, {student}"),
            exam_id: exam.into(),
            exam_title: "Midterm".into(),
            score: 0,
            total_questions: 10,
            percentage: pct,
            answers: Default::default(),
            completed_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn filter_by_exam_and_student() {
        let rs = [result("s1", "e1", 50), result("s2", "e1", 70), result("s1", "e2", 90)];
        let f = ResultFilter {
            exam_id: Some("e1".into()),
            student_id: None,
        };
        assert_eq!(rs.iter().filter(|r| f.matches(r)).count(), 2);
        let f = ResultFilter {
            exam_id: Some("e1".into()),
            student_id: Some("s1".into()),
        };
        assert_eq!(rs.iter().filter(|r| f.matches(r)).count(), 1);
        assert!(ResultFilter::default().matches(&rs[2]));
    }

    #[test]
    fn dashboard_average() {
        let now = Utc::now();
        let d = Dashboard::compute(2, 5, &[], &[result("a", "e", 50), result("b", "e", 75)], now);
        assert_eq!(d.average_percentage, Some(63)); // 62.5
        assert_eq!(d.total_results, 2);
        assert_eq!(Dashboard::compute(0, 0, &[], &[], now).average_percentage, None);
    }

    #[test]
    fn csv_quotes_and_marks_status() {
        let out = results_csv(&[result("s1", "e1", 60), result("s2", "e1", 59)]).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines[0],
            "student,exam,score,total_questions,percentage,completed_at,status"
        );
        assert!(lines[1].starts_with("\"Name, s1\",Midterm,0,10,60%,"));
        assert!(lines[1].ends_with(",pass"));
        assert!(lines[2].ends_with(",fail"));
    }

    #[test]
    fn csv_of_nothing_is_empty() {
        assert_eq!(results_csv(&[]).unwrap(), "");
    }
}
