//! roster-store — Persistence for enrolled identities, class sessions and
//! attendance records.
//!
//! The attendance engine only talks to [`AttendanceStore`]; [`SqliteStore`]
//! is the bundled implementation.

pub mod models;
pub mod sqlite;

pub use models::{
    AttendanceEntry, AttendanceRecord, AttendanceStatus, ClassSession, Cohort, Identity,
    NewIdentity,
};
pub use sqlite::SqliteStore;

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity {0} not found")]
    IdentityNotFound(i64),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
    #[error("store connection lock poisoned")]
    Poisoned,
}

/// Persistence operations the attendance engine depends on.
pub trait AttendanceStore {
    fn list_identities(&self) -> Result<Vec<Identity>, StoreError>;

    fn add_identity(&self, identity: &NewIdentity) -> Result<Identity, StoreError>;

    /// Update name, external id, thumbnail and cohort. The embedding is never rewritten.
    fn update_identity(&self, identity: &Identity) -> Result<(), StoreError>;

    /// Delete an identity and its attendance records. Returns false if it did not exist.
    fn delete_identity(&self, id: i64) -> Result<bool, StoreError>;

    fn find_identity_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Identity>, StoreError>;

    /// Whether any attendance exists for the identity on `date`, in any session.
    fn has_attendance_on(&self, identity_id: i64, date: NaiveDate) -> Result<bool, StoreError>;

    /// Insert a record. Returns false, writing nothing, when the identity
    /// already has a record for that date.
    fn mark_attendance(&self, record: &AttendanceRecord) -> Result<bool, StoreError>;

    /// Attendance joined with identity details, newest first.
    fn attendance_records(
        &self,
        date: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceEntry>, StoreError>;

    /// Every record of one identity, newest first.
    fn attendance_for_identity(
        &self,
        identity_id: i64,
    ) -> Result<Vec<AttendanceEntry>, StoreError>;

    fn list_active_sessions(&self) -> Result<Vec<ClassSession>, StoreError>;

    fn start_session(&self, owner: &str, cohort: &Cohort) -> Result<ClassSession, StoreError>;

    /// Mark a session inactive and stamp its end time. Returns false if no
    /// active session had that id.
    fn end_session(&self, id: i64) -> Result<bool, StoreError>;

    fn sessions_for_owner(&self, owner: &str) -> Result<Vec<ClassSession>, StoreError>;
}
