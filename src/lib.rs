// coursehub library - course sales, balances and group enrollment
// This exposes the core components for the CLI, testing and embedding

pub mod api;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod enrollment;
pub mod observability;
pub mod policy;
pub mod store;
pub mod telemetry;

// Re-export key types for easy access
pub use api::{ApiResponse, CourseApi, Status};
pub use catalog::{Catalog, CatalogError, CourseReport, CreatedCourse, GroupRoster};
pub use config::CoursehubConfig;
pub use domain::{
    Account, AccountId, Course, CourseId, Group, GroupId, Lesson, LessonId, NewAccount,
    NewCourse, NewLesson, Profile, GROUPS_PER_COURSE, GROUP_CAPACITY,
};
pub use enrollment::{EnrollError, EnrollOutcome, Enrollment, EnrollmentWorkflow};
pub use observability::{enrollment_metrics, EnrollmentMetrics, OperationTimer};
pub use policy::{Caller, Principal};
pub use store::{MemoryStore, Store, StoreError, Transaction};
#[cfg(feature = "database")]
pub use store::SqliteStore;
pub use telemetry::{generate_correlation_id, init_telemetry};
