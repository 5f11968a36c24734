// Input checks for administrative writes. Field limits mirror the storage schema.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

use super::model::{CourseChanges, NewAccount, NewCourse, NewLesson};

pub const MAX_TITLE_LEN: usize = 250;
pub const MAX_LINK_LEN: usize = 250;
pub const MAX_EMAIL_LEN: usize = 250;
pub const MAX_USERNAME_LEN: usize = 150;
pub const MAX_NAME_LEN: usize = 150;
pub const MAX_GROUP_TITLE_LEN: usize = 255;

static EMAIL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

static LINK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://[^\s/$.?#][^\s]*$").expect("valid link regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} must be at most {max} characters")]
    TooLong { field: &'static str, max: usize },

    #[error("{field} is not a valid {kind}")]
    Malformed {
        field: &'static str,
        kind: &'static str,
    },
}

fn check_text(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if value.chars().count() > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(())
}

/// Length limit for fields that may be left blank
fn check_optional_text(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.chars().count() > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(())
}

pub fn validate_new_account(account: &NewAccount) -> Result<(), ValidationError> {
    check_text("email", &account.profile.email, MAX_EMAIL_LEN)?;
    if !EMAIL_PATTERN.is_match(&account.profile.email) {
        return Err(ValidationError::Malformed {
            field: "email",
            kind: "email address",
        });
    }
    check_text("username", &account.profile.username, MAX_USERNAME_LEN)?;
    check_optional_text("first_name", &account.profile.first_name, MAX_NAME_LEN)?;
    check_optional_text("last_name", &account.profile.last_name, MAX_NAME_LEN)
}

pub fn validate_new_course(course: &NewCourse) -> Result<(), ValidationError> {
    check_text("title", &course.title, MAX_TITLE_LEN)
}

pub fn validate_course_changes(changes: &CourseChanges) -> Result<(), ValidationError> {
    match &changes.title {
        Some(title) => check_text("title", title, MAX_TITLE_LEN),
        None => Ok(()),
    }
}

pub fn validate_new_lesson(lesson: &NewLesson) -> Result<(), ValidationError> {
    check_text("title", &lesson.title, MAX_TITLE_LEN)?;
    check_text("link", &lesson.link, MAX_LINK_LEN)?;
    if !LINK_PATTERN.is_match(&lesson.link) {
        return Err(ValidationError::Malformed {
            field: "link",
            kind: "URL",
        });
    }
    Ok(())
}

pub fn validate_group_title(title: &str) -> Result<(), ValidationError> {
    check_text("title", title, MAX_GROUP_TITLE_LEN)
}
