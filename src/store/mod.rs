//! Storage seams for the course catalog.
//!
//! Every read and write goes through a [`Transaction`] obtained from a [`Store`].
//! Dropping a transaction without calling [`Transaction::commit`] discards all of
//! its writes, so multi-step operations such as enrollment either land in full or
//! not at all.
//!
//! Two backends are provided:
//! - [`MemoryStore`]: process-local state behind a single async mutex
//! - `SqliteStore`: sqlx-backed persistence (requires the `database` feature)

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{
    Account, AccountId, Course, CourseChanges, CourseId, Group, GroupId, Lesson, LessonId,
    NewAccount, NewCourse, NewGroup, NewLesson,
};

pub mod memory;
#[cfg(feature = "database")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "database")]
pub use sqlite::SqliteStore;

/// Infrastructure failures raised by a storage backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "database")]
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A guarded write was refused because the row changed underneath it
    #[error("Write conflict: {reason}")]
    Conflict { reason: String },

    #[error("{entity} {id} does not exist")]
    Missing { entity: &'static str, id: i64 },

    #[error("Corrupt record: {reason}")]
    Corrupt { reason: String },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Accounts, their balance records and purchased courses
#[async_trait]
pub trait AccountStore: Send {
    /// Insert the identity row only; the balance record is written separately
    async fn insert_account(&mut self, account: &NewAccount) -> StoreResult<AccountId>;

    async fn insert_balance(&mut self, account: AccountId, cash: u64) -> StoreResult<()>;

    async fn get_account(&mut self, id: AccountId) -> StoreResult<Option<Account>>;

    /// All accounts, newest first
    async fn list_accounts(&mut self) -> StoreResult<Vec<Account>>;

    async fn count_accounts(&mut self) -> StoreResult<u64>;

    /// Set the balance to `new_balance` only if it still equals `expected`.
    /// Returns [`StoreError::Conflict`] otherwise.
    async fn update_balance(
        &mut self,
        id: AccountId,
        expected: u64,
        new_balance: u64,
    ) -> StoreResult<()>;

    /// Record a purchase. Returns [`StoreError::Conflict`] if already present.
    async fn add_entitlement(&mut self, id: AccountId, course: CourseId) -> StoreResult<()>;

    /// Number of accounts entitled to the course
    async fn count_students(&mut self, course: CourseId) -> StoreResult<u64>;
}

#[async_trait]
pub trait CourseStore: Send {
    async fn insert_course(&mut self, course: &NewCourse) -> StoreResult<Course>;

    async fn get_course(&mut self, id: CourseId) -> StoreResult<Option<Course>>;

    /// All courses, newest first
    async fn list_courses(&mut self) -> StoreResult<Vec<Course>>;

    async fn update_course(
        &mut self,
        id: CourseId,
        changes: &CourseChanges,
    ) -> StoreResult<Option<Course>>;

    /// Removes the course with its lessons, groups and entitlements
    async fn delete_course(&mut self, id: CourseId) -> StoreResult<bool>;
}

#[async_trait]
pub trait GroupStore: Send {
    async fn bulk_create_groups(&mut self, groups: &[NewGroup]) -> StoreResult<Vec<Group>>;

    /// Groups of a course in creation order
    async fn list_groups_by_course(&mut self, course: CourseId) -> StoreResult<Vec<Group>>;

    async fn get_group(&mut self, id: GroupId) -> StoreResult<Option<Group>>;

    /// Add a member. Refuses with [`StoreError::Conflict`] when the group is full.
    async fn add_member(&mut self, group: GroupId, account: AccountId) -> StoreResult<()>;

    async fn delete_group(&mut self, id: GroupId) -> StoreResult<bool>;
}

#[async_trait]
pub trait LessonStore: Send {
    async fn insert_lesson(&mut self, course: CourseId, lesson: &NewLesson)
        -> StoreResult<Lesson>;

    /// Lessons of a course, oldest first
    async fn list_lessons_by_course(&mut self, course: CourseId) -> StoreResult<Vec<Lesson>>;

    async fn get_lesson(&mut self, id: LessonId) -> StoreResult<Option<Lesson>>;

    async fn delete_lesson(&mut self, id: LessonId) -> StoreResult<bool>;
}

/// A unit of work spanning every store
#[async_trait]
pub trait Transaction: AccountStore + CourseStore + GroupStore + LessonStore + Send {
    /// Make all writes of this transaction visible
    async fn commit(self) -> StoreResult<()>;
}

/// Entry point to a storage backend
#[async_trait]
pub trait Store: Send + Sync {
    type Tx: Transaction + 'static;

    async fn begin(&self) -> StoreResult<Self::Tx>;
}
