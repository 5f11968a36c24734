// Domain layer: entities, identifiers and input checks for the course catalog.

pub mod model;
pub mod validation;

pub use model::{
    Account, AccountId, Course, CourseChanges, CourseId, Group, GroupId, Lesson, LessonId,
    NewAccount, NewCourse, NewGroup, NewLesson, Profile, DEFAULT_INITIAL_BALANCE,
    GROUPS_PER_COURSE, GROUP_CAPACITY,
};
pub use validation::ValidationError;
