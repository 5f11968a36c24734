use serde_json::Value;
use std::sync::Arc;
use tracing::error;

use super::{ApiResponse, Status};
use crate::catalog::{Catalog, CatalogError};
use crate::domain::{
    AccountId, CourseChanges, CourseId, GroupId, LessonId, NewAccount, NewCourse, NewLesson,
};
use crate::enrollment::{EnrollError, EnrollOutcome, EnrollmentWorkflow};
use crate::policy::{self, Access, Caller, Denial, Principal};
use crate::store::Store;

const MSG_COURSE_NOT_FOUND: &str = "Course not found.";
const MSG_ALREADY_OWNED: &str = "Course already purchased on your account.";
const MSG_INSUFFICIENT_FUNDS: &str = "Insufficient funds on your account.";
const MSG_NO_FREE_GROUP: &str = "No free groups for this course.";
const MSG_LOGIN_REQUIRED: &str = "Login required to access this course.";
const MSG_NO_ACCESS: &str = "You don't have access to this course.";

fn catalog_error(err: CatalogError) -> ApiResponse {
    match err {
        CatalogError::NotFound("course") => {
            ApiResponse::message(Status::NotFound, MSG_COURSE_NOT_FOUND)
        }
        CatalogError::NotFound(entity) => {
            ApiResponse::message(Status::NotFound, format!("{entity} not found."))
        }
        CatalogError::Validation(e) => ApiResponse::message(Status::BadRequest, e.to_string()),
        CatalogError::Duplicate(reason) => ApiResponse::message(Status::BadRequest, reason),
        CatalogError::BalanceOverflow(account) => ApiResponse::message(
            Status::BadRequest,
            format!("Balance of account {account} cannot hold that amount."),
        ),
        CatalogError::Storage(e) => {
            error!(error = %e, "Catalog storage failure");
            ApiResponse::message(Status::InternalServerError, "Internal server error.")
        }
    }
}

/// Version 1 of the course API
pub struct CourseApi<S: Store> {
    catalog: Catalog<S>,
    enrollment: EnrollmentWorkflow<S>,
}

impl<S: Store> CourseApi<S> {
    pub fn new(store: Arc<S>, initial_balance: u64) -> Self {
        Self {
            catalog: Catalog::new(store.clone(), initial_balance),
            enrollment: EnrollmentWorkflow::new(store),
        }
    }

    pub fn catalog(&self) -> &Catalog<S> {
        &self.catalog
    }

    pub fn enrollment(&self) -> &EnrollmentWorkflow<S> {
        &self.enrollment
    }

    /// Build an authenticated caller from the current state of an account
    pub async fn resolve_caller(&self, account: AccountId) -> Result<Caller, CatalogError> {
        let account = self.catalog.get_account(account).await?;
        Ok(Caller::Authenticated(Principal::from(&account)))
    }

    /// `POST /courses/{id}/pay`
    ///
    /// 201 echoes `payload` for a new purchase, 200 when the course is already
    /// owned, 400 for insufficient funds or full groups, 404 for unknown courses.
    pub async fn pay(&self, caller: &Caller, course: CourseId, payload: Value) -> ApiResponse {
        let principal = match policy::require_authenticated(caller) {
            Ok(principal) => principal,
            Err(denial) => return ApiResponse::denied(denial),
        };

        match self.enrollment.enroll(principal.account, course).await {
            Ok(EnrollOutcome::Enrolled(_)) => ApiResponse {
                status: Status::Created,
                body: payload,
            },
            Ok(EnrollOutcome::AlreadyOwned(_)) => {
                ApiResponse::message(Status::Ok, MSG_ALREADY_OWNED)
            }
            Err(EnrollError::NotFound("course")) => {
                ApiResponse::message(Status::NotFound, MSG_COURSE_NOT_FOUND)
            }
            Err(EnrollError::NotFound(entity)) => {
                ApiResponse::message(Status::NotFound, format!("{entity} not found."))
            }
            Err(EnrollError::InsufficientFunds { .. }) => {
                ApiResponse::message(Status::BadRequest, MSG_INSUFFICIENT_FUNDS)
            }
            Err(EnrollError::NoAvailableGroup { .. }) => {
                ApiResponse::message(Status::BadRequest, MSG_NO_FREE_GROUP)
            }
            Err(EnrollError::Storage(e)) => {
                error!(error = %e, course_id = course.0, "Payment failed");
                ApiResponse::message(Status::InternalServerError, "Internal server error.")
            }
        }
    }

    /// `GET /courses`
    pub async fn list_courses(&self, caller: &Caller) -> ApiResponse {
        if let Err(denial) = policy::read_only_or_admin(caller, Access::Read) {
            return ApiResponse::denied(denial);
        }
        match self.catalog.course_reports().await {
            Ok(reports) => ApiResponse::json(Status::Ok, &reports),
            Err(e) => catalog_error(e),
        }
    }

    /// `GET /courses/{id}`
    ///
    /// An unknown course is reported before access is checked. The report is
    /// only built for callers allowed to see it.
    pub async fn retrieve_course(&self, caller: &Caller, course: CourseId) -> ApiResponse {
        if let Err(e) = self.catalog.get_course(course).await {
            return catalog_error(e);
        }

        match policy::can_view_course(caller, course) {
            Ok(()) => {}
            Err(Denial::Unauthenticated) => {
                return ApiResponse::message(Status::Unauthorized, MSG_LOGIN_REQUIRED)
            }
            Err(Denial::Forbidden) => {
                return ApiResponse::message(Status::Forbidden, MSG_NO_ACCESS)
            }
        }

        match self.catalog.course_report(course).await {
            Ok(report) => ApiResponse::json(Status::Ok, &report),
            Err(e) => catalog_error(e),
        }
    }

    /// `POST /courses`; provisions the default groups
    pub async fn create_course(&self, caller: &Caller, new: NewCourse) -> ApiResponse {
        if let Err(denial) = policy::read_only_or_admin(caller, Access::Write) {
            return ApiResponse::denied(denial);
        }
        match self.catalog.create_course(new).await {
            Ok(created) => ApiResponse::json(Status::Created, &created),
            Err(e) => catalog_error(e),
        }
    }

    /// `PATCH /courses/{id}`
    pub async fn update_course(
        &self,
        caller: &Caller,
        course: CourseId,
        changes: CourseChanges,
    ) -> ApiResponse {
        if let Err(denial) = policy::read_only_or_admin(caller, Access::Write) {
            return ApiResponse::denied(denial);
        }
        match self.catalog.update_course(course, changes).await {
            Ok(course) => ApiResponse::json(Status::Ok, &course),
            Err(e) => catalog_error(e),
        }
    }

    /// `DELETE /courses/{id}`
    pub async fn delete_course(&self, caller: &Caller, course: CourseId) -> ApiResponse {
        if let Err(denial) = policy::read_only_or_admin(caller, Access::Write) {
            return ApiResponse::denied(denial);
        }
        match self.catalog.delete_course(course).await {
            Ok(()) => ApiResponse::no_content(),
            Err(e) => catalog_error(e),
        }
    }

    /// `GET /courses/for_buy`: courses the caller has not purchased
    pub async fn for_buy(&self, caller: &Caller) -> ApiResponse {
        let principal = match policy::require_authenticated(caller) {
            Ok(principal) => principal,
            Err(denial) => return ApiResponse::denied(denial),
        };

        match self.catalog.courses_for_buy(principal.account).await {
            Ok(reports) => ApiResponse::json(Status::Ok, &reports),
            Err(e) => catalog_error(e),
        }
    }

    /// `GET /courses/{id}/groups`
    pub async fn course_groups(&self, caller: &Caller, course: CourseId) -> ApiResponse {
        if let Err(denial) = policy::require_authenticated(caller) {
            return ApiResponse::denied(denial);
        }
        match self.catalog.list_groups(course).await {
            Ok(rosters) => ApiResponse::json(Status::Ok, &rosters),
            Err(e) => catalog_error(e),
        }
    }

    /// `POST /courses/{id}/group_admin`
    pub async fn create_group(
        &self,
        caller: &Caller,
        course: CourseId,
        title: String,
    ) -> ApiResponse {
        if let Err(denial) = policy::require_admin(caller) {
            return ApiResponse::denied(denial);
        }
        match self.catalog.create_group(course, title).await {
            Ok(group) => ApiResponse::json(Status::Created, &group),
            Err(e) => catalog_error(e),
        }
    }

    /// `DELETE /courses/{id}/group_admin/{group}`
    pub async fn delete_group(
        &self,
        caller: &Caller,
        course: CourseId,
        group: GroupId,
    ) -> ApiResponse {
        if let Err(denial) = policy::require_admin(caller) {
            return ApiResponse::denied(denial);
        }
        match self.catalog.delete_group(course, group).await {
            Ok(()) => ApiResponse::no_content(),
            Err(e) => catalog_error(e),
        }
    }

    /// `GET /courses/{id}/lessons`
    pub async fn list_lessons(&self, caller: &Caller, course: CourseId) -> ApiResponse {
        if let Err(denial) = policy::student_or_admin(caller, course, Access::Read) {
            return ApiResponse::denied(denial);
        }
        match self.catalog.list_lessons(course).await {
            Ok(lessons) => ApiResponse::json(Status::Ok, &lessons),
            Err(e) => catalog_error(e),
        }
    }

    /// `POST /courses/{id}/lessons`
    pub async fn create_lesson(
        &self,
        caller: &Caller,
        course: CourseId,
        new: NewLesson,
    ) -> ApiResponse {
        if let Err(denial) = policy::student_or_admin(caller, course, Access::Write) {
            return ApiResponse::denied(denial);
        }
        match self.catalog.add_lesson(course, new).await {
            Ok(lesson) => ApiResponse::json(Status::Created, &lesson),
            Err(e) => catalog_error(e),
        }
    }

    /// `DELETE /courses/{id}/lessons/{lesson}`
    pub async fn delete_lesson(
        &self,
        caller: &Caller,
        course: CourseId,
        lesson: LessonId,
    ) -> ApiResponse {
        if let Err(denial) = policy::student_or_admin(caller, course, Access::Write) {
            return ApiResponse::denied(denial);
        }
        match self.catalog.delete_lesson(course, lesson).await {
            Ok(()) => ApiResponse::no_content(),
            Err(e) => catalog_error(e),
        }
    }

    /// `POST /users`: open sign-up; privileged accounts need an admin caller
    pub async fn create_account(&self, caller: &Caller, new: NewAccount) -> ApiResponse {
        if new.is_staff || new.is_superuser {
            if let Err(denial) = policy::require_admin(caller) {
                return ApiResponse::denied(denial);
            }
        }
        match self.catalog.create_account(new).await {
            Ok(account) => ApiResponse::json(Status::Created, &account),
            Err(e) => catalog_error(e),
        }
    }

    /// `GET /users`: staff only
    pub async fn list_accounts(&self, caller: &Caller) -> ApiResponse {
        if let Err(denial) = policy::require_admin(caller) {
            return ApiResponse::denied(denial);
        }
        match self.catalog.list_accounts().await {
            Ok(accounts) => ApiResponse::json(Status::Ok, &accounts),
            Err(e) => catalog_error(e),
        }
    }

    /// `GET /users/{id}`: the account itself or an admin
    pub async fn get_account(&self, caller: &Caller, account: AccountId) -> ApiResponse {
        let principal = match policy::require_authenticated(caller) {
            Ok(principal) => principal,
            Err(denial) => return ApiResponse::denied(denial),
        };
        if principal.account != account && !principal.is_admin() {
            return ApiResponse::denied(Denial::Forbidden);
        }
        match self.catalog.get_account(account).await {
            Ok(account) => ApiResponse::json(Status::Ok, &account),
            Err(e) => catalog_error(e),
        }
    }

    /// `POST /users/{id}/balance`
    pub async fn top_up(&self, caller: &Caller, account: AccountId, amount: u64) -> ApiResponse {
        if let Err(denial) = policy::require_admin(caller) {
            return ApiResponse::denied(denial);
        }
        match self.catalog.top_up(account, amount).await {
            Ok(account) => ApiResponse::json(Status::Ok, &account),
            Err(e) => catalog_error(e),
        }
    }
}
