// Storage failures during enrollment
// A scripted transaction shows that failed writes abort the purchase without commit

use async_trait::async_trait;
use chrono::Utc;
use coursehub::domain::{
    Account, AccountId, Course, CourseChanges, CourseId, Group, GroupId, Lesson, LessonId,
    NewAccount, NewCourse, NewGroup, NewLesson, Profile,
};
use coursehub::enrollment::{EnrollError, EnrollmentWorkflow};
use coursehub::store::{
    AccountStore, CourseStore, GroupStore, LessonStore, Store, StoreError, StoreResult,
    Transaction,
};
use mockall::{mock, predicate::*};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

mock! {
    pub Tx {}

    #[async_trait]
    impl AccountStore for Tx {
        async fn insert_account(&mut self, account: &NewAccount) -> StoreResult<AccountId>;
        async fn insert_balance(&mut self, account: AccountId, cash: u64) -> StoreResult<()>;
        async fn get_account(&mut self, id: AccountId) -> StoreResult<Option<Account>>;
        async fn list_accounts(&mut self) -> StoreResult<Vec<Account>>;
        async fn count_accounts(&mut self) -> StoreResult<u64>;
        async fn update_balance(
            &mut self,
            id: AccountId,
            expected: u64,
            new_balance: u64,
        ) -> StoreResult<()>;
        async fn add_entitlement(&mut self, id: AccountId, course: CourseId) -> StoreResult<()>;
        async fn count_students(&mut self, course: CourseId) -> StoreResult<u64>;
    }

    #[async_trait]
    impl CourseStore for Tx {
        async fn insert_course(&mut self, course: &NewCourse) -> StoreResult<Course>;
        async fn get_course(&mut self, id: CourseId) -> StoreResult<Option<Course>>;
        async fn list_courses(&mut self) -> StoreResult<Vec<Course>>;
        async fn update_course(
            &mut self,
            id: CourseId,
            changes: &CourseChanges,
        ) -> StoreResult<Option<Course>>;
        async fn delete_course(&mut self, id: CourseId) -> StoreResult<bool>;
    }

    #[async_trait]
    impl GroupStore for Tx {
        async fn bulk_create_groups(&mut self, groups: &[NewGroup]) -> StoreResult<Vec<Group>>;
        async fn list_groups_by_course(&mut self, course: CourseId) -> StoreResult<Vec<Group>>;
        async fn get_group(&mut self, id: GroupId) -> StoreResult<Option<Group>>;
        async fn add_member(&mut self, group: GroupId, account: AccountId) -> StoreResult<()>;
        async fn delete_group(&mut self, id: GroupId) -> StoreResult<bool>;
    }

    #[async_trait]
    impl LessonStore for Tx {
        async fn insert_lesson(&mut self, course: CourseId, lesson: &NewLesson) -> StoreResult<Lesson>;
        async fn list_lessons_by_course(&mut self, course: CourseId) -> StoreResult<Vec<Lesson>>;
        async fn get_lesson(&mut self, id: LessonId) -> StoreResult<Option<Lesson>>;
        async fn delete_lesson(&mut self, id: LessonId) -> StoreResult<bool>;
    }

    #[async_trait]
    impl Transaction for Tx {
        async fn commit(self) -> StoreResult<()>;
    }
}

/// Hands out pre-scripted transactions in order
struct ScriptedStore {
    transactions: Mutex<Vec<MockTx>>,
}

impl ScriptedStore {
    fn new(tx: MockTx) -> Self {
        Self {
            transactions: Mutex::new(vec![tx]),
        }
    }
}

#[async_trait]
impl Store for ScriptedStore {
    type Tx = MockTx;

    async fn begin(&self) -> StoreResult<MockTx> {
        self.transactions
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| StoreError::Backend("no scripted transaction left".to_string()))
    }
}

const BUYER: AccountId = AccountId(1);
const COURSE: CourseId = CourseId(7);

fn course(price: u64) -> Course {
    Course {
        id: COURSE,
        author: AccountId(99),
        title: "Mocked Course".to_string(),
        start_date: Utc::now(),
        price,
    }
}

fn buyer(balance: u64) -> Account {
    Account {
        id: BUYER,
        profile: Profile {
            email: "buyer@example.com".to_string(),
            username: "buyer".to_string(),
            first_name: String::new(),
            last_name: String::new(),
        },
        is_staff: false,
        is_superuser: false,
        cash_balance: balance,
        entitled_course_ids: BTreeSet::new(),
    }
}

fn open_group() -> Group {
    Group {
        id: GroupId(3),
        course: COURSE,
        title: "Group #1".to_string(),
        members: BTreeSet::new(),
    }
}

fn scripted_reads(tx: &mut MockTx, balance: u64, price: u64) {
    tx.expect_get_course()
        .with(eq(COURSE))
        .returning(move |_| Ok(Some(course(price))));
    tx.expect_get_account()
        .with(eq(BUYER))
        .returning(move |_| Ok(Some(buyer(balance))));
    tx.expect_list_groups_by_course()
        .with(eq(COURSE))
        .returning(|_| Ok(vec![open_group()]));
}

#[tokio::test]
async fn test_balance_conflict_aborts_before_membership() {
    let mut tx = MockTx::new();
    scripted_reads(&mut tx, 500, 200);
    tx.expect_update_balance()
        .with(eq(BUYER), eq(500), eq(300))
        .times(1)
        .returning(|_, _, _| {
            Err(StoreError::Conflict {
                reason: "balance changed".to_string(),
            })
        });
    tx.expect_add_entitlement().times(0);
    tx.expect_add_member().times(0);
    tx.expect_commit().times(0);

    let workflow = EnrollmentWorkflow::new(Arc::new(ScriptedStore::new(tx)));
    let err = workflow.enroll(BUYER, COURSE).await.unwrap_err();
    assert!(matches!(
        err,
        EnrollError::Storage(StoreError::Conflict { .. })
    ));
}

#[tokio::test]
async fn test_full_group_on_write_aborts_without_commit() {
    let mut tx = MockTx::new();
    scripted_reads(&mut tx, 500, 200);
    tx.expect_update_balance().times(1).returning(|_, _, _| Ok(()));
    tx.expect_add_entitlement()
        .with(eq(BUYER), eq(COURSE))
        .times(1)
        .returning(|_, _| Ok(()));
    tx.expect_add_member()
        .with(eq(GroupId(3)), eq(BUYER))
        .times(1)
        .returning(|group, _| {
            Err(StoreError::Conflict {
                reason: format!("group {group} is full"),
            })
        });
    tx.expect_commit().times(0);

    let workflow = EnrollmentWorkflow::new(Arc::new(ScriptedStore::new(tx)));
    let err = workflow.enroll(BUYER, COURSE).await.unwrap_err();
    assert!(matches!(
        err,
        EnrollError::Storage(StoreError::Conflict { .. })
    ));
}

#[tokio::test]
async fn test_commit_failure_is_reported() {
    let mut tx = MockTx::new();
    scripted_reads(&mut tx, 500, 200);
    tx.expect_update_balance().returning(|_, _, _| Ok(()));
    tx.expect_add_entitlement().returning(|_, _| Ok(()));
    tx.expect_add_member().returning(|_, _| Ok(()));
    tx.expect_commit()
        .times(1)
        .returning(|| Err(StoreError::Backend("disk full".to_string())));

    let workflow = EnrollmentWorkflow::new(Arc::new(ScriptedStore::new(tx)));
    let err = workflow.enroll(BUYER, COURSE).await.unwrap_err();
    assert!(matches!(err, EnrollError::Storage(StoreError::Backend(_))));
}

#[tokio::test]
async fn test_failed_begin_surfaces_as_storage_error() {
    let store = ScriptedStore {
        transactions: Mutex::new(Vec::new()),
    };
    let workflow = EnrollmentWorkflow::new(Arc::new(store));
    let err = workflow.enroll(BUYER, COURSE).await.unwrap_err();
    assert!(matches!(err, EnrollError::Storage(StoreError::Backend(_))));
}
