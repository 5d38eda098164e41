//! roster-engine — Attendance engine over the face pipeline and the store.
//!
//! [`AttendanceService`] turns frames into per-face attendance outcomes and
//! enrolls new identities. [`spawn_engine`] moves a service onto its own
//! thread so async callers can feed it frames without ever running two at
//! once.

pub mod attendance;
pub mod cache;
pub mod config;
pub mod engine;
pub mod stability;

pub use attendance::{
    AttendanceError, AttendanceService, EnrollError, EnrollRequest, FaceOutcome, FaceStatus,
    IdentityUpdate, Policy,
};
pub use cache::IdentityCache;
pub use config::{Config, ConfigError};
pub use engine::{load_models, spawn_engine, EngineError, EngineHandle};
pub use stability::{StabilityState, StabilityTracker};
