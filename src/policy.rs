//! Access rules for the course API.
//!
//! Every rule is a pure function of the caller and the resource it touches. The
//! API layer evaluates a rule before calling into the catalog or the enrollment
//! workflow; nothing here performs I/O.

use serde::Serialize;

use crate::domain::{Account, AccountId, CourseId};

/// Who is making a request, as established by the identity provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Anonymous,
    Authenticated(Principal),
}

/// Snapshot of an authenticated account's privileges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub account: AccountId,
    pub is_staff: bool,
    pub is_superuser: bool,
    pub owned_courses: Vec<CourseId>,
}

impl From<&Account> for Principal {
    fn from(account: &Account) -> Self {
        Self {
            account: account.id,
            is_staff: account.is_staff,
            is_superuser: account.is_superuser,
            owned_courses: account.entitled_course_ids.iter().copied().collect(),
        }
    }
}

impl Caller {
    pub fn principal(&self) -> Option<&Principal> {
        match self {
            Caller::Anonymous => None,
            Caller::Authenticated(principal) => Some(principal),
        }
    }
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.is_staff || self.is_superuser
    }

    pub fn owns(&self, course: CourseId) -> bool {
        self.owned_courses.contains(&course)
    }
}

/// Read-only requests versus writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Denial {
    /// No identity was presented
    Unauthenticated,
    /// The identity lacks the privilege
    Forbidden,
}

pub type Decision = Result<(), Denial>;

/// Any signed-in account
pub fn require_authenticated(caller: &Caller) -> Result<&Principal, Denial> {
    caller.principal().ok_or(Denial::Unauthenticated)
}

/// Staff and superusers only
pub fn require_admin(caller: &Caller) -> Decision {
    let principal = require_authenticated(caller)?;
    if principal.is_admin() {
        Ok(())
    } else {
        Err(Denial::Forbidden)
    }
}

/// Course catalog: anyone may read, only staff may change it
pub fn read_only_or_admin(caller: &Caller, access: Access) -> Decision {
    match (access, caller.principal()) {
        (Access::Read, _) => Ok(()),
        (Access::Write, Some(principal)) if principal.is_admin() => Ok(()),
        (Access::Write, Some(_)) => Err(Denial::Forbidden),
        (Access::Write, None) => Err(Denial::Unauthenticated),
    }
}

/// Full course details: the owner of the course or staff
pub fn can_view_course(caller: &Caller, course: CourseId) -> Decision {
    let principal = require_authenticated(caller)?;
    if principal.owns(course) || principal.is_admin() {
        Ok(())
    } else {
        Err(Denial::Forbidden)
    }
}

/// Lessons: students of the course may read, staff may read and write
pub fn student_or_admin(caller: &Caller, course: CourseId, access: Access) -> Decision {
    let principal = require_authenticated(caller)?;
    if principal.is_admin() {
        return Ok(());
    }
    match access {
        Access::Read if principal.owns(course) => Ok(()),
        _ => Err(Denial::Forbidden),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student(owned: &[i64]) -> Caller {
        Caller::Authenticated(Principal {
            account: AccountId(1),
            is_staff: false,
            is_superuser: false,
            owned_courses: owned.iter().copied().map(CourseId).collect(),
        })
    }

    fn staff() -> Caller {
        Caller::Authenticated(Principal {
            account: AccountId(2),
            is_staff: true,
            is_superuser: false,
            owned_courses: Vec::new(),
        })
    }

    #[test]
    fn test_catalog_is_readable_by_everyone() {
        assert_eq!(read_only_or_admin(&Caller::Anonymous, Access::Read), Ok(()));
        assert_eq!(read_only_or_admin(&student(&[]), Access::Read), Ok(()));
    }

    #[test]
    fn test_catalog_writes_need_staff() {
        assert_eq!(
            read_only_or_admin(&Caller::Anonymous, Access::Write),
            Err(Denial::Unauthenticated)
        );
        assert_eq!(
            read_only_or_admin(&student(&[1]), Access::Write),
            Err(Denial::Forbidden)
        );
        assert_eq!(read_only_or_admin(&staff(), Access::Write), Ok(()));
    }

    #[test]
    fn test_course_details_visibility() {
        assert_eq!(
            can_view_course(&Caller::Anonymous, CourseId(1)),
            Err(Denial::Unauthenticated)
        );
        assert_eq!(
            can_view_course(&student(&[2]), CourseId(1)),
            Err(Denial::Forbidden)
        );
        assert_eq!(can_view_course(&student(&[1]), CourseId(1)), Ok(()));
        assert_eq!(can_view_course(&staff(), CourseId(1)), Ok(()));
    }

    #[test]
    fn test_lessons_for_students_of_the_course() {
        assert_eq!(
            student_or_admin(&student(&[1]), CourseId(1), Access::Read),
            Ok(())
        );
        assert_eq!(
            student_or_admin(&student(&[1]), CourseId(1), Access::Write),
            Err(Denial::Forbidden)
        );
        assert_eq!(
            student_or_admin(&student(&[3]), CourseId(1), Access::Read),
            Err(Denial::Forbidden)
        );
        assert_eq!(
            student_or_admin(&staff(), CourseId(1), Access::Write),
            Ok(())
        );
    }

    #[test]
    fn test_superuser_counts_as_admin() {
        let caller = Caller::Authenticated(Principal {
            account: AccountId(3),
            is_staff: false,
            is_superuser: true,
            owned_courses: Vec::new(),
        });
        assert_eq!(require_admin(&caller), Ok(()));
    }
}
