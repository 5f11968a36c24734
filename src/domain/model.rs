use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Maximum number of students in a single group
pub const GROUP_CAPACITY: usize = 30;

/// Number of groups provisioned together with every new course
pub const GROUPS_PER_COURSE: usize = 10;

/// Cash credited to a freshly created account when no configuration overrides it
pub const DEFAULT_INITIAL_BALANCE: u64 = 1000;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }
    };
}

entity_id!(
    /// Identity of a user account
    AccountId
);
entity_id!(
    /// Identity of a course
    CourseId
);
entity_id!(
    /// Identity of a course group
    GroupId
);
entity_id!(LessonId);

/// Personal details of a student or staff member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub email: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
}

impl Profile {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// A user account together with its balance and purchased courses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub profile: Profile,
    pub is_staff: bool,
    pub is_superuser: bool,
    /// Internal cash available for purchases
    pub cash_balance: u64,
    pub entitled_course_ids: BTreeSet<CourseId>,
}

impl Account {
    pub fn owns(&self, course: CourseId) -> bool {
        self.entitled_course_ids.contains(&course)
    }

    pub fn can_afford(&self, price: u64) -> bool {
        self.cash_balance >= price
    }
}

/// Input for account creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAccount {
    pub profile: Profile,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(default)]
    pub is_superuser: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: CourseId,
    pub author: AccountId,
    pub title: String,
    pub start_date: DateTime<Utc>,
    pub price: u64,
}

/// Input for course creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCourse {
    pub author: AccountId,
    pub title: String,
    #[serde(default)]
    pub price: u64,
}

/// Partial update of a course; absent fields stay unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourseChanges {
    pub title: Option<String>,
    pub price: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: LessonId,
    pub course: CourseId,
    pub title: String,
    pub link: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLesson {
    pub title: String,
    pub link: String,
}

/// A fixed-capacity roster of students within one course
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub course: CourseId,
    pub title: String,
    pub members: BTreeSet<AccountId>,
}

impl Group {
    pub fn has_capacity(&self) -> bool {
        self.members.len() < GROUP_CAPACITY
    }

    /// Share of seats taken, in percent
    pub fn fill_percent(&self) -> f64 {
        self.members.len() as f64 / GROUP_CAPACITY as f64 * 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewGroup {
    pub course: CourseId,
    pub title: String,
}

impl NewGroup {
    /// The groups every course starts with: "Group #1" through "Group #10"
    pub fn default_set(course: CourseId) -> Vec<NewGroup> {
        (1..=GROUPS_PER_COURSE)
            .map(|ordinal| NewGroup {
                course,
                title: format!("Group #{ordinal}"),
            })
            .collect()
    }
}
