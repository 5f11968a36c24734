use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    AccountStore, CourseStore, GroupStore, LessonStore, Store, StoreError, StoreResult,
    Transaction,
};
use crate::domain::{
    Account, AccountId, Course, CourseChanges, CourseId, Group, GroupId, Lesson, LessonId,
    NewAccount, NewCourse, NewGroup, NewLesson, Profile, GROUP_CAPACITY,
};

#[derive(Debug, Clone)]
struct AccountRow {
    profile: Profile,
    is_staff: bool,
    is_superuser: bool,
    entitlements: BTreeSet<CourseId>,
}

#[derive(Debug, Clone, Default)]
struct State {
    account_seq: i64,
    course_seq: i64,
    group_seq: i64,
    lesson_seq: i64,
    accounts: BTreeMap<AccountId, AccountRow>,
    balances: BTreeMap<AccountId, u64>,
    courses: BTreeMap<CourseId, Course>,
    lessons: BTreeMap<LessonId, Lesson>,
    groups: BTreeMap<GroupId, Group>,
}

impl State {
    fn account(&self, id: AccountId) -> StoreResult<Option<Account>> {
        let Some(row) = self.accounts.get(&id) else {
            return Ok(None);
        };
        let cash_balance = *self.balances.get(&id).ok_or_else(|| StoreError::Corrupt {
            reason: format!("account {id} has no balance record"),
        })?;
        Ok(Some(Account {
            id,
            profile: row.profile.clone(),
            is_staff: row.is_staff,
            is_superuser: row.is_superuser,
            cash_balance,
            entitled_course_ids: row.entitlements.clone(),
        }))
    }
}

/// Process-local store.
///
/// A transaction holds the store-wide lock from `begin` until it is committed or
/// dropped and works on a private copy of the state, so transactions are fully
/// serialized and an uncommitted one leaves no trace.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<State>,
    staged: State,
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> StoreResult<MemoryTx> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(MemoryTx { guard, staged })
    }
}

#[async_trait]
impl Transaction for MemoryTx {
    async fn commit(self) -> StoreResult<()> {
        let MemoryTx { mut guard, staged } = self;
        *guard = staged;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryTx {
    async fn insert_account(&mut self, account: &NewAccount) -> StoreResult<AccountId> {
        let state = &mut self.staged;
        let taken = state
            .accounts
            .values()
            .any(|row| row.profile.email.eq_ignore_ascii_case(&account.profile.email));
        if taken {
            return Err(StoreError::Conflict {
                reason: format!("email {} is already registered", account.profile.email),
            });
        }

        state.account_seq += 1;
        let id = AccountId(state.account_seq);
        state.accounts.insert(
            id,
            AccountRow {
                profile: account.profile.clone(),
                is_staff: account.is_staff,
                is_superuser: account.is_superuser,
                entitlements: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    async fn insert_balance(&mut self, account: AccountId, cash: u64) -> StoreResult<()> {
        let state = &mut self.staged;
        if !state.accounts.contains_key(&account) {
            return Err(StoreError::Missing {
                entity: "account",
                id: account.0,
            });
        }
        if state.balances.contains_key(&account) {
            return Err(StoreError::Conflict {
                reason: format!("account {account} already has a balance record"),
            });
        }
        state.balances.insert(account, cash);
        Ok(())
    }

    async fn get_account(&mut self, id: AccountId) -> StoreResult<Option<Account>> {
        self.staged.account(id)
    }

    async fn list_accounts(&mut self) -> StoreResult<Vec<Account>> {
        let state = &self.staged;
        let mut accounts = Vec::with_capacity(state.accounts.len());
        for id in state.accounts.keys().rev() {
            if let Some(account) = state.account(*id)? {
                accounts.push(account);
            }
        }
        Ok(accounts)
    }

    async fn count_accounts(&mut self) -> StoreResult<u64> {
        Ok(self.staged.accounts.len() as u64)
    }

    async fn update_balance(
        &mut self,
        id: AccountId,
        expected: u64,
        new_balance: u64,
    ) -> StoreResult<()> {
        let cash = self
            .staged
            .balances
            .get_mut(&id)
            .ok_or(StoreError::Missing {
                entity: "balance",
                id: id.0,
            })?;
        if *cash != expected {
            return Err(StoreError::Conflict {
                reason: format!("balance of account {id} changed from {expected} to {cash}"),
            });
        }
        *cash = new_balance;
        Ok(())
    }

    async fn add_entitlement(&mut self, id: AccountId, course: CourseId) -> StoreResult<()> {
        if !self.staged.courses.contains_key(&course) {
            return Err(StoreError::Missing {
                entity: "course",
                id: course.0,
            });
        }
        let row = self.staged.accounts.get_mut(&id).ok_or(StoreError::Missing {
            entity: "account",
            id: id.0,
        })?;
        if !row.entitlements.insert(course) {
            return Err(StoreError::Conflict {
                reason: format!("account {id} already owns course {course}"),
            });
        }
        Ok(())
    }

    async fn count_students(&mut self, course: CourseId) -> StoreResult<u64> {
        let count = self
            .staged
            .accounts
            .values()
            .filter(|row| row.entitlements.contains(&course))
            .count();
        Ok(count as u64)
    }
}

#[async_trait]
impl CourseStore for MemoryTx {
    async fn insert_course(&mut self, course: &NewCourse) -> StoreResult<Course> {
        let state = &mut self.staged;
        if !state.accounts.contains_key(&course.author) {
            return Err(StoreError::Missing {
                entity: "account",
                id: course.author.0,
            });
        }
        state.course_seq += 1;
        let created = Course {
            id: CourseId(state.course_seq),
            author: course.author,
            title: course.title.clone(),
            start_date: Utc::now(),
            price: course.price,
        };
        state.courses.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_course(&mut self, id: CourseId) -> StoreResult<Option<Course>> {
        Ok(self.staged.courses.get(&id).cloned())
    }

    async fn list_courses(&mut self) -> StoreResult<Vec<Course>> {
        Ok(self.staged.courses.values().rev().cloned().collect())
    }

    async fn update_course(
        &mut self,
        id: CourseId,
        changes: &CourseChanges,
    ) -> StoreResult<Option<Course>> {
        let Some(course) = self.staged.courses.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(title) = &changes.title {
            course.title = title.clone();
        }
        if let Some(price) = changes.price {
            course.price = price;
        }
        Ok(Some(course.clone()))
    }

    async fn delete_course(&mut self, id: CourseId) -> StoreResult<bool> {
        let state = &mut self.staged;
        if state.courses.remove(&id).is_none() {
            return Ok(false);
        }
        state.lessons.retain(|_, lesson| lesson.course != id);
        state.groups.retain(|_, group| group.course != id);
        for row in state.accounts.values_mut() {
            row.entitlements.remove(&id);
        }
        Ok(true)
    }
}

#[async_trait]
impl GroupStore for MemoryTx {
    async fn bulk_create_groups(&mut self, groups: &[NewGroup]) -> StoreResult<Vec<Group>> {
        let state = &mut self.staged;
        let mut created = Vec::with_capacity(groups.len());
        for group in groups {
            if !state.courses.contains_key(&group.course) {
                return Err(StoreError::Missing {
                    entity: "course",
                    id: group.course.0,
                });
            }
            state.group_seq += 1;
            let row = Group {
                id: GroupId(state.group_seq),
                course: group.course,
                title: group.title.clone(),
                members: BTreeSet::new(),
            };
            state.groups.insert(row.id, row.clone());
            created.push(row);
        }
        Ok(created)
    }

    async fn list_groups_by_course(&mut self, course: CourseId) -> StoreResult<Vec<Group>> {
        Ok(self
            .staged
            .groups
            .values()
            .filter(|group| group.course == course)
            .cloned()
            .collect())
    }

    async fn get_group(&mut self, id: GroupId) -> StoreResult<Option<Group>> {
        Ok(self.staged.groups.get(&id).cloned())
    }

    async fn add_member(&mut self, group: GroupId, account: AccountId) -> StoreResult<()> {
        if !self.staged.accounts.contains_key(&account) {
            return Err(StoreError::Missing {
                entity: "account",
                id: account.0,
            });
        }
        let row = self.staged.groups.get_mut(&group).ok_or(StoreError::Missing {
            entity: "group",
            id: group.0,
        })?;
        if row.members.contains(&account) {
            return Ok(());
        }
        if row.members.len() >= GROUP_CAPACITY {
            return Err(StoreError::Conflict {
                reason: format!("group {group} is full"),
            });
        }
        row.members.insert(account);
        Ok(())
    }

    async fn delete_group(&mut self, id: GroupId) -> StoreResult<bool> {
        Ok(self.staged.groups.remove(&id).is_some())
    }
}

#[async_trait]
impl LessonStore for MemoryTx {
    async fn insert_lesson(
        &mut self,
        course: CourseId,
        lesson: &NewLesson,
    ) -> StoreResult<Lesson> {
        let state = &mut self.staged;
        if !state.courses.contains_key(&course) {
            return Err(StoreError::Missing {
                entity: "course",
                id: course.0,
            });
        }
        state.lesson_seq += 1;
        let row = Lesson {
            id: LessonId(state.lesson_seq),
            course,
            title: lesson.title.clone(),
            link: lesson.link.clone(),
        };
        state.lessons.insert(row.id, row.clone());
        Ok(row)
    }

    async fn list_lessons_by_course(&mut self, course: CourseId) -> StoreResult<Vec<Lesson>> {
        Ok(self
            .staged
            .lessons
            .values()
            .filter(|lesson| lesson.course == course)
            .cloned()
            .collect())
    }

    async fn get_lesson(&mut self, id: LessonId) -> StoreResult<Option<Lesson>> {
        Ok(self.staged.lessons.get(&id).cloned())
    }

    async fn delete_lesson(&mut self, id: LessonId) -> StoreResult<bool> {
        Ok(self.staged.lessons.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_account(email: &str) -> NewAccount {
        NewAccount {
            profile: Profile {
                email: email.to_string(),
                username: email.split('@').next().unwrap_or_default().to_string(),
                first_name: "Test".to_string(),
                last_name: "User".to_string(),
            },
            is_staff: false,
            is_superuser: false,
        }
    }

    #[tokio::test]
    async fn test_dropped_transaction_leaves_no_trace() {
        let store = MemoryStore::new();

        {
            let mut tx = store.begin().await.unwrap();
            let id = tx.insert_account(&new_account("a@example.com")).await.unwrap();
            tx.insert_balance(id, 100).await.unwrap();
            // dropped without commit
        }

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.count_accounts().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_committed_transaction_is_visible() {
        let store = MemoryStore::new();

        let mut tx = store.begin().await.unwrap();
        let id = tx.insert_account(&new_account("a@example.com")).await.unwrap();
        tx.insert_balance(id, 100).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let account = tx.get_account(id).await.unwrap().unwrap();
        assert_eq!(account.cash_balance, 100);
        assert!(account.entitled_course_ids.is_empty());
    }

    #[tokio::test]
    async fn test_account_without_balance_is_corrupt() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let id = tx.insert_account(&new_account("a@example.com")).await.unwrap();

        let err = tx.get_account(id).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_email_conflicts() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_account(&new_account("a@example.com")).await.unwrap();

        let err = tx
            .insert_account(&new_account("A@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_update_balance_checks_expected_value() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let id = tx.insert_account(&new_account("a@example.com")).await.unwrap();
        tx.insert_balance(id, 100).await.unwrap();

        let err = tx.update_balance(id, 90, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        tx.update_balance(id, 100, 40).await.unwrap();
        assert_eq!(tx.get_account(id).await.unwrap().unwrap().cash_balance, 40);
    }

    #[tokio::test]
    async fn test_add_member_refuses_full_group() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let author = tx.insert_account(&new_account("author@example.com")).await.unwrap();
        tx.insert_balance(author, 0).await.unwrap();
        let course = tx
            .insert_course(&NewCourse {
                author,
                title: "Rust".to_string(),
                price: 0,
            })
            .await
            .unwrap();
        let groups = tx
            .bulk_create_groups(&[NewGroup {
                course: course.id,
                title: "Group #1".to_string(),
            }])
            .await
            .unwrap();

        for i in 0..GROUP_CAPACITY {
            let id = tx
                .insert_account(&new_account(&format!("s{i}@example.com")))
                .await
                .unwrap();
            tx.add_member(groups[0].id, id).await.unwrap();
        }

        let extra = tx.insert_account(&new_account("late@example.com")).await.unwrap();
        let err = tx.add_member(groups[0].id, extra).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let group = tx.get_group(groups[0].id).await.unwrap().unwrap();
        assert_eq!(group.members.len(), GROUP_CAPACITY);
    }

    #[tokio::test]
    async fn test_delete_course_cascades() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let author = tx.insert_account(&new_account("author@example.com")).await.unwrap();
        tx.insert_balance(author, 0).await.unwrap();
        let course = tx
            .insert_course(&NewCourse {
                author,
                title: "Rust".to_string(),
                price: 0,
            })
            .await
            .unwrap();
        tx.bulk_create_groups(&NewGroup::default_set(course.id))
            .await
            .unwrap();
        tx.insert_lesson(
            course.id,
            &NewLesson {
                title: "Intro".to_string(),
                link: "https://example.com/1".to_string(),
            },
        )
        .await
        .unwrap();
        tx.add_entitlement(author, course.id).await.unwrap();

        assert!(tx.delete_course(course.id).await.unwrap());
        assert!(tx.list_groups_by_course(course.id).await.unwrap().is_empty());
        assert!(tx.list_lessons_by_course(course.id).await.unwrap().is_empty());
        let account = tx.get_account(author).await.unwrap().unwrap();
        assert!(!account.owns(course.id));
    }
}
