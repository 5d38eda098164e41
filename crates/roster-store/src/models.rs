use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use roster_core::Embedding;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Course / year / semester / group attributes.
///
/// On an identity these describe who the person is; on a session they act
/// as a filter where an unset (or empty) field means "any".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cohort {
    pub course: Option<String>,
    pub year: Option<String>,
    pub semester: Option<String>,
    pub group: Option<String>,
}

impl Cohort {
    /// Whether a session with this cohort as its filter applies to `member`.
    ///
    /// Every set filter field must equal the member's field.
    pub fn admits(&self, member: &Cohort) -> bool {
        field_admits(&self.course, &member.course)
            && field_admits(&self.year, &member.year)
            && field_admits(&self.semester, &member.semester)
            && field_admits(&self.group, &member.group)
    }
}

fn field_admits(filter: &Option<String>, value: &Option<String>) -> bool {
    match filter.as_deref() {
        None | Some("") => true,
        Some(wanted) => value.as_deref() == Some(wanted),
    }
}

/// An enrolled person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: i64,
    pub name: String,
    /// Reference id from outside the system (student number, badge id, ...).
    pub external_id: String,
    #[serde(skip)]
    pub embedding: Embedding,
    pub thumbnail_path: Option<String>,
    pub cohort: Cohort,
    pub created_at: DateTime<Utc>,
}

/// An identity that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub name: String,
    pub external_id: String,
    pub embedding: Embedding,
    pub thumbnail_path: Option<String>,
    pub cohort: Cohort,
}

/// A class session started by its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassSession {
    pub id: i64,
    pub owner: String,
    pub cohort: Cohort,
    pub is_active: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "Present",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Present" => Ok(AttendanceStatus::Present),
            other => Err(format!("unknown attendance status {other:?}")),
        }
    }
}

/// Write-once attendance mark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub identity_id: i64,
    pub session_id: i64,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: AttendanceStatus,
}

/// Attendance record joined with the identity it belongs to, for reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEntry {
    pub id: i64,
    pub name: String,
    pub external_id: String,
    #[serde(flatten)]
    pub record: AttendanceRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cohort(course: Option<&str>, year: Option<&str>) -> Cohort {
        Cohort {
            course: course.map(str::to_string),
            year: year.map(str::to_string),
            ..Cohort::default()
        }
    }

    #[test]
    fn test_filter_with_unset_year_matches_course() {
        let session = cohort(Some("CS"), None);
        assert!(session.admits(&cohort(Some("CS"), Some("2"))));
        assert!(session.admits(&cohort(Some("CS"), None)));
    }

    #[test]
    fn test_filter_rejects_other_course() {
        let session = cohort(Some("CS"), None);
        assert!(!session.admits(&cohort(Some("EE"), Some("2"))));
    }

    #[test]
    fn test_all_set_fields_must_match() {
        let session = cohort(Some("CS"), Some("3"));
        assert!(!session.admits(&cohort(Some("CS"), Some("2"))));
        assert!(session.admits(&cohort(Some("CS"), Some("3"))));
    }

    #[test]
    fn test_empty_filter_field_means_any() {
        let session = Cohort {
            course: Some(String::new()),
            group: Some("B".into()),
            ..Cohort::default()
        };
        let member = Cohort {
            course: Some("Math".into()),
            group: Some("B".into()),
            ..Cohort::default()
        };
        assert!(session.admits(&member));
        assert!(Cohort::default().admits(&member));
    }

    #[test]
    fn test_set_filter_does_not_match_missing_member_field() {
        let session = cohort(Some("CS"), None);
        assert!(!session.admits(&Cohort::default()));
    }
}
