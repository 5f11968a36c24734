//! Administrative operations on accounts, courses, lessons and groups.
//!
//! Course creation always provisions the default group set in the same
//! transaction as the course row, and account creation writes the identity and
//! its balance record together.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::domain::validation::{
    validate_course_changes, validate_group_title, validate_new_account, validate_new_course,
    validate_new_lesson,
};
use crate::domain::{
    Account, AccountId, Course, CourseChanges, CourseId, Group, GroupId, Lesson, LessonId,
    NewAccount, NewCourse, NewGroup, NewLesson, Profile, ValidationError,
};
use crate::store::{
    AccountStore, CourseStore, GroupStore, LessonStore, Store, StoreError, Transaction,
};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Invalid input: {0}")]
    Validation(#[from] ValidationError),

    #[error("Already exists: {0}")]
    Duplicate(String),

    #[error("Balance overflow for account {0}")]
    BalanceOverflow(AccountId),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// A freshly created course with its provisioned groups
#[derive(Debug, Clone, Serialize)]
pub struct CreatedCourse {
    pub course: Course,
    pub groups: Vec<Group>,
}

/// Course listing entry with enrollment statistics
#[derive(Debug, Clone, Serialize)]
pub struct CourseReport {
    #[serde(flatten)]
    pub course: Course,
    pub lessons_count: usize,
    pub lessons: Vec<String>,
    pub students_count: u64,
    pub groups_filled_percent: f64,
    pub demand_course_percent: f64,
}

/// A group together with the profiles of its students
#[derive(Debug, Clone, Serialize)]
pub struct GroupRoster {
    pub id: GroupId,
    pub title: String,
    pub course: CourseId,
    pub students: Vec<Profile>,
}

/// Average seat occupancy across the groups that exist for a course.
///
/// Zero when the course has no students or no groups.
pub fn groups_filled_percent(groups: &[Group], students_count: u64) -> f64 {
    if students_count == 0 || groups.is_empty() {
        return 0.0;
    }
    let total: f64 = groups.iter().map(Group::fill_percent).sum();
    total / groups.len() as f64
}

/// Share of all accounts that bought the course, in percent
pub fn demand_percent(students_count: u64, accounts_count: u64) -> f64 {
    if accounts_count == 0 {
        return 0.0;
    }
    students_count as f64 / accounts_count as f64 * 100.0
}

pub struct Catalog<S: Store> {
    store: Arc<S>,
    initial_balance: u64,
}

impl<S: Store> Catalog<S> {
    pub fn new(store: Arc<S>, initial_balance: u64) -> Self {
        Self {
            store,
            initial_balance,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Create the account and its balance record as one unit
    pub async fn create_account(&self, new: NewAccount) -> CatalogResult<Account> {
        validate_new_account(&new)?;

        let mut tx = self.store.begin().await?;
        let id = match tx.insert_account(&new).await {
            Ok(id) => id,
            Err(StoreError::Conflict { reason }) => return Err(CatalogError::Duplicate(reason)),
            Err(e) => return Err(e.into()),
        };
        tx.insert_balance(id, self.initial_balance).await?;
        let account = tx
            .get_account(id)
            .await?
            .ok_or(CatalogError::NotFound("account"))?;
        tx.commit().await?;

        info!(account_id = id.0, balance = self.initial_balance, "Account created");
        Ok(account)
    }

    pub async fn get_account(&self, id: AccountId) -> CatalogResult<Account> {
        let mut tx = self.store.begin().await?;
        tx.get_account(id)
            .await?
            .ok_or(CatalogError::NotFound("account"))
    }

    pub async fn list_accounts(&self) -> CatalogResult<Vec<Account>> {
        let mut tx = self.store.begin().await?;
        Ok(tx.list_accounts().await?)
    }

    /// Credit cash to an account
    pub async fn top_up(&self, id: AccountId, amount: u64) -> CatalogResult<Account> {
        let mut tx = self.store.begin().await?;
        let account = tx
            .get_account(id)
            .await?
            .ok_or(CatalogError::NotFound("account"))?;
        let new_balance = account
            .cash_balance
            .checked_add(amount)
            .ok_or(CatalogError::BalanceOverflow(id))?;
        tx.update_balance(id, account.cash_balance, new_balance)
            .await?;
        tx.commit().await?;

        info!(account_id = id.0, amount, new_balance, "Balance topped up");
        Ok(Account {
            cash_balance: new_balance,
            ..account
        })
    }

    /// Create a course and its ten default groups in one transaction
    pub async fn create_course(&self, new: NewCourse) -> CatalogResult<CreatedCourse> {
        validate_new_course(&new)?;

        let mut tx = self.store.begin().await?;
        if tx.get_account(new.author).await?.is_none() {
            return Err(CatalogError::NotFound("author"));
        }
        let course = tx.insert_course(&new).await?;
        let groups = tx
            .bulk_create_groups(&NewGroup::default_set(course.id))
            .await?;
        tx.commit().await?;

        info!(
            course_id = course.id.0,
            groups = groups.len(),
            "Course created with default groups"
        );
        Ok(CreatedCourse { course, groups })
    }

    pub async fn get_course(&self, id: CourseId) -> CatalogResult<Course> {
        let mut tx = self.store.begin().await?;
        tx.get_course(id)
            .await?
            .ok_or(CatalogError::NotFound("course"))
    }

    pub async fn update_course(
        &self,
        id: CourseId,
        changes: CourseChanges,
    ) -> CatalogResult<Course> {
        validate_course_changes(&changes)?;

        let mut tx = self.store.begin().await?;
        let course = tx
            .update_course(id, &changes)
            .await?
            .ok_or(CatalogError::NotFound("course"))?;
        tx.commit().await?;
        Ok(course)
    }

    pub async fn delete_course(&self, id: CourseId) -> CatalogResult<()> {
        let mut tx = self.store.begin().await?;
        if !tx.delete_course(id).await? {
            return Err(CatalogError::NotFound("course"));
        }
        tx.commit().await?;
        info!(course_id = id.0, "Course deleted");
        Ok(())
    }

    pub async fn list_courses(&self) -> CatalogResult<Vec<Course>> {
        let mut tx = self.store.begin().await?;
        Ok(tx.list_courses().await?)
    }

    /// Reports for the courses the account has not bought yet, read in one transaction
    pub async fn courses_for_buy(&self, account: AccountId) -> CatalogResult<Vec<CourseReport>> {
        let mut tx = self.store.begin().await?;
        let account = tx
            .get_account(account)
            .await?
            .ok_or(CatalogError::NotFound("account"))?;
        let accounts_count = tx.count_accounts().await?;
        let courses = tx.list_courses().await?;

        let mut reports = Vec::new();
        for course in courses.into_iter().filter(|course| !account.owns(course.id)) {
            reports.push(build_report(&mut tx, course, accounts_count).await?);
        }
        Ok(reports)
    }

    pub async fn course_report(&self, id: CourseId) -> CatalogResult<CourseReport> {
        let mut tx = self.store.begin().await?;
        let course = tx
            .get_course(id)
            .await?
            .ok_or(CatalogError::NotFound("course"))?;
        let accounts_count = tx.count_accounts().await?;
        Ok(build_report(&mut tx, course, accounts_count).await?)
    }

    pub async fn course_reports(&self) -> CatalogResult<Vec<CourseReport>> {
        let mut tx = self.store.begin().await?;
        let accounts_count = tx.count_accounts().await?;
        let courses = tx.list_courses().await?;

        let mut reports = Vec::with_capacity(courses.len());
        for course in courses {
            reports.push(build_report(&mut tx, course, accounts_count).await?);
        }
        Ok(reports)
    }

    pub async fn add_lesson(&self, course: CourseId, new: NewLesson) -> CatalogResult<Lesson> {
        validate_new_lesson(&new)?;

        let mut tx = self.store.begin().await?;
        if tx.get_course(course).await?.is_none() {
            return Err(CatalogError::NotFound("course"));
        }
        let lesson = tx.insert_lesson(course, &new).await?;
        tx.commit().await?;
        Ok(lesson)
    }

    pub async fn list_lessons(&self, course: CourseId) -> CatalogResult<Vec<Lesson>> {
        let mut tx = self.store.begin().await?;
        if tx.get_course(course).await?.is_none() {
            return Err(CatalogError::NotFound("course"));
        }
        Ok(tx.list_lessons_by_course(course).await?)
    }

    pub async fn delete_lesson(&self, course: CourseId, lesson: LessonId) -> CatalogResult<()> {
        let mut tx = self.store.begin().await?;
        match tx.get_lesson(lesson).await? {
            Some(found) if found.course == course => {}
            _ => return Err(CatalogError::NotFound("lesson")),
        }
        tx.delete_lesson(lesson).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Groups of a course with their students, in creation order
    pub async fn list_groups(&self, course: CourseId) -> CatalogResult<Vec<GroupRoster>> {
        let mut tx = self.store.begin().await?;
        if tx.get_course(course).await?.is_none() {
            return Err(CatalogError::NotFound("course"));
        }
        let groups = tx.list_groups_by_course(course).await?;

        let mut rosters = Vec::with_capacity(groups.len());
        for group in groups {
            let mut students = Vec::with_capacity(group.members.len());
            for member in &group.members {
                if let Some(account) = tx.get_account(*member).await? {
                    students.push(account.profile);
                }
            }
            rosters.push(GroupRoster {
                id: group.id,
                title: group.title,
                course: group.course,
                students,
            });
        }
        Ok(rosters)
    }

    pub async fn create_group(&self, course: CourseId, title: String) -> CatalogResult<Group> {
        validate_group_title(&title)?;

        let mut tx = self.store.begin().await?;
        if tx.get_course(course).await?.is_none() {
            return Err(CatalogError::NotFound("course"));
        }
        let mut created = tx.bulk_create_groups(&[NewGroup { course, title }]).await?;
        let group = created
            .pop()
            .ok_or_else(|| StoreError::Backend("group insert returned no row".to_string()))?;
        tx.commit().await?;
        Ok(group)
    }

    pub async fn delete_group(&self, course: CourseId, group: GroupId) -> CatalogResult<()> {
        let mut tx = self.store.begin().await?;
        match tx.get_group(group).await? {
            Some(found) if found.course == course => {}
            _ => return Err(CatalogError::NotFound("group")),
        }
        tx.delete_group(group).await?;
        tx.commit().await?;
        info!(course_id = course.0, group_id = group.0, "Group deleted");
        Ok(())
    }
}

async fn build_report<T: Transaction>(
    tx: &mut T,
    course: Course,
    accounts_count: u64,
) -> Result<CourseReport, StoreError> {
    let lessons = tx.list_lessons_by_course(course.id).await?;
    let groups = tx.list_groups_by_course(course.id).await?;
    let students_count = tx.count_students(course.id).await?;

    Ok(CourseReport {
        lessons_count: lessons.len(),
        lessons: lessons.into_iter().map(|lesson| lesson.title).collect(),
        students_count,
        groups_filled_percent: groups_filled_percent(&groups, students_count),
        demand_course_percent: demand_percent(students_count, accounts_count),
        course,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GROUP_CAPACITY;
    use crate::store::MemoryStore;
    use std::collections::BTreeSet;

    fn group_with(members: usize) -> Group {
        Group {
            id: GroupId(1),
            course: CourseId(1),
            title: "Group #1".to_string(),
            members: (0..members as i64).map(AccountId).collect::<BTreeSet<_>>(),
        }
    }

    fn new_account(email: &str, is_staff: bool) -> NewAccount {
        NewAccount {
            profile: Profile {
                email: email.to_string(),
                username: email.split('@').next().unwrap_or_default().to_string(),
                first_name: "Test".to_string(),
                last_name: "User".to_string(),
            },
            is_staff,
            is_superuser: false,
        }
    }

    #[test]
    fn test_fill_percent_averages_existing_groups() {
        let groups = vec![group_with(GROUP_CAPACITY), group_with(0)];
        assert_eq!(groups_filled_percent(&groups, 30), 50.0);

        let three = vec![group_with(15), group_with(15), group_with(15)];
        assert_eq!(groups_filled_percent(&three, 45), 50.0);
    }

    #[test]
    fn test_fill_percent_without_students_or_groups() {
        assert_eq!(groups_filled_percent(&[group_with(3)], 0), 0.0);
        assert_eq!(groups_filled_percent(&[], 10), 0.0);
    }

    #[test]
    fn test_demand_percent() {
        assert_eq!(demand_percent(1, 4), 25.0);
        assert_eq!(demand_percent(0, 0), 0.0);
    }

    #[tokio::test]
    async fn test_create_account_writes_balance() {
        let catalog = Catalog::new(Arc::new(MemoryStore::new()), 1000);
        let account = catalog
            .create_account(new_account("sam@example.com", false))
            .await
            .unwrap();
        assert_eq!(account.cash_balance, 1000);

        let err = catalog
            .create_account(new_account("sam@example.com", false))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_create_course_provisions_ten_groups() {
        let catalog = Catalog::new(Arc::new(MemoryStore::new()), 0);
        let author = catalog
            .create_account(new_account("author@example.com", true))
            .await
            .unwrap();

        let created = catalog
            .create_course(NewCourse {
                author: author.id,
                title: "Rust".to_string(),
                price: 500,
            })
            .await
            .unwrap();

        let rosters = catalog.list_groups(created.course.id).await.unwrap();
        let titles: Vec<_> = rosters.iter().map(|r| r.title.clone()).collect();
        let expected: Vec<_> = (1..=10).map(|i| format!("Group #{i}")).collect();
        assert_eq!(titles, expected);
    }

    #[tokio::test]
    async fn test_create_course_with_unknown_author_writes_nothing() {
        let catalog = Catalog::new(Arc::new(MemoryStore::new()), 0);
        let err = catalog
            .create_course(NewCourse {
                author: AccountId(77),
                title: "Rust".to_string(),
                price: 500,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::NotFound("author")));
        assert!(catalog.list_courses().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_top_up_adds_cash() {
        let catalog = Catalog::new(Arc::new(MemoryStore::new()), 100);
        let account = catalog
            .create_account(new_account("sam@example.com", false))
            .await
            .unwrap();

        let updated = catalog.top_up(account.id, 400).await.unwrap();
        assert_eq!(updated.cash_balance, 500);
        assert_eq!(
            catalog.get_account(account.id).await.unwrap().cash_balance,
            500
        );
    }

    #[tokio::test]
    async fn test_lessons_are_scoped_to_course() {
        let catalog = Catalog::new(Arc::new(MemoryStore::new()), 0);
        let author = catalog
            .create_account(new_account("author@example.com", true))
            .await
            .unwrap();
        let a = catalog
            .create_course(NewCourse {
                author: author.id,
                title: "A".to_string(),
                price: 0,
            })
            .await
            .unwrap();
        let b = catalog
            .create_course(NewCourse {
                author: author.id,
                title: "B".to_string(),
                price: 0,
            })
            .await
            .unwrap();

        let lesson = catalog
            .add_lesson(
                a.course.id,
                NewLesson {
                    title: "Intro".to_string(),
                    link: "https://example.com/intro".to_string(),
                },
            )
            .await
            .unwrap();

        let err = catalog
            .delete_lesson(b.course.id, lesson.id)
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::NotFound("lesson")));

        catalog.delete_lesson(a.course.id, lesson.id).await.unwrap();
        assert!(catalog.list_lessons(a.course.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_for_buy_reports_skip_owned_courses() {
        let catalog = Catalog::new(Arc::new(MemoryStore::new()), 1000);
        let author = catalog
            .create_account(new_account("author@example.com", true))
            .await
            .unwrap();
        let buyer = catalog
            .create_account(new_account("buyer@example.com", false))
            .await
            .unwrap();
        let mut course_ids = Vec::new();
        for title in ["Owned", "Open"] {
            let created = catalog
                .create_course(NewCourse {
                    author: author.id,
                    title: title.to_string(),
                    price: 0,
                })
                .await
                .unwrap();
            course_ids.push(created.course.id);
        }

        let mut tx = catalog.store().begin().await.unwrap();
        tx.add_entitlement(buyer.id, course_ids[0]).await.unwrap();
        tx.commit().await.unwrap();

        let reports = catalog.courses_for_buy(buyer.id).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].course.id, course_ids[1]);
        assert_eq!(reports[0].students_count, 0);

        let reports = catalog.courses_for_buy(author.id).await.unwrap();
        assert_eq!(reports.len(), 2);
        let owned = reports
            .iter()
            .find(|report| report.course.id == course_ids[0])
            .unwrap();
        assert_eq!(owned.students_count, 1);
        assert_eq!(owned.demand_course_percent, 50.0);

        let err = catalog.courses_for_buy(AccountId(404)).await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound("account")));
    }
}
