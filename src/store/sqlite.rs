use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{migrate::MigrateDatabase, Row, Sqlite, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use super::{
    AccountStore, CourseStore, GroupStore, LessonStore, Store, StoreError, StoreResult,
    Transaction,
};
use crate::domain::{
    Account, AccountId, Course, CourseChanges, CourseId, Group, GroupId, Lesson, LessonId,
    NewAccount, NewCourse, NewGroup, NewLesson, Profile, GROUP_CAPACITY,
};

/// How long a transaction waits for the write lock held by another one
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// SQLite-backed store for persistent catalog state
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (and create if needed) the database, optionally running migrations
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        auto_migrate: bool,
    ) -> StoreResult<Self> {
        if !Sqlite::database_exists(database_url).await? {
            info!("Creating database at {}", database_url);
            Sqlite::create_database(database_url).await?;
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        if auto_migrate {
            store.migrate().await?;
        }
        Ok(store)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Close database connections gracefully
    pub async fn shutdown(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
    }
}

pub struct SqliteTx {
    tx: sqlx::Transaction<'static, Sqlite>,
}

#[async_trait]
impl Store for SqliteStore {
    type Tx = SqliteTx;

    /// Takes the write lock up front; a deferred read-then-write transaction
    /// fails with SQLITE_BUSY instead of waiting when it cannot upgrade.
    async fn begin(&self) -> StoreResult<SqliteTx> {
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Ok(SqliteTx { tx })
    }
}

#[async_trait]
impl Transaction for SqliteTx {
    async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

fn to_u64(value: i64, column: &str) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt {
        reason: format!("negative value {value} in column {column}"),
    })
}

fn to_i64(value: u64, column: &str) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::Backend(format!(
        "value {value} for column {column} exceeds the storable range"
    )))
}

fn conflict_on_unique(err: sqlx::Error, reason: impl FnOnce() -> String) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict {
            reason: reason(),
        },
        _ => StoreError::Database(err),
    }
}

fn course_from_row(row: &SqliteRow) -> StoreResult<Course> {
    let start_date: String = row.try_get("start_date")?;
    let start_date = DateTime::parse_from_rfc3339(&start_date)
        .map_err(|e| StoreError::Corrupt {
            reason: format!("invalid start_date {start_date:?}: {e}"),
        })?
        .with_timezone(&Utc);

    Ok(Course {
        id: CourseId(row.try_get("id")?),
        author: AccountId(row.try_get("author_id")?),
        title: row.try_get("title")?,
        start_date,
        price: to_u64(row.try_get("price")?, "price")?,
    })
}

fn lesson_from_row(row: &SqliteRow) -> StoreResult<Lesson> {
    Ok(Lesson {
        id: LessonId(row.try_get("id")?),
        course: CourseId(row.try_get("course_id")?),
        title: row.try_get("title")?,
        link: row.try_get("link")?,
    })
}

impl SqliteTx {
    async fn members_of(&mut self, group: GroupId) -> StoreResult<BTreeSet<AccountId>> {
        let members: Vec<i64> =
            sqlx::query_scalar("SELECT account_id FROM group_members WHERE group_id = ?1")
                .bind(group.0)
                .fetch_all(&mut *self.tx)
                .await?;
        Ok(members.into_iter().map(AccountId).collect())
    }
}

#[async_trait]
impl AccountStore for SqliteTx {
    async fn insert_account(&mut self, account: &NewAccount) -> StoreResult<AccountId> {
        let result = sqlx::query(
            r#"
            INSERT INTO accounts (email, username, first_name, last_name, is_staff, is_superuser)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&account.profile.email)
        .bind(&account.profile.username)
        .bind(&account.profile.first_name)
        .bind(&account.profile.last_name)
        .bind(account.is_staff)
        .bind(account.is_superuser)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!("email {} is already registered", account.profile.email)
            })
        })?;

        Ok(AccountId(result.last_insert_rowid()))
    }

    async fn insert_balance(&mut self, account: AccountId, cash: u64) -> StoreResult<()> {
        sqlx::query("INSERT INTO balances (account_id, cash) VALUES (?1, ?2)")
            .bind(account.0)
            .bind(to_i64(cash, "cash")?)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                conflict_on_unique(e, || {
                    format!("account {account} already has a balance record")
                })
            })?;
        Ok(())
    }

    async fn get_account(&mut self, id: AccountId) -> StoreResult<Option<Account>> {
        let row = sqlx::query(
            r#"
            SELECT a.id, a.email, a.username, a.first_name, a.last_name,
                   a.is_staff, a.is_superuser, b.cash
            FROM accounts a
            LEFT JOIN balances b ON b.account_id = a.id
            WHERE a.id = ?1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&mut *self.tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let cash: Option<i64> = row.try_get("cash")?;
        let cash = cash.ok_or_else(|| StoreError::Corrupt {
            reason: format!("account {id} has no balance record"),
        })?;

        let entitlements: Vec<i64> =
            sqlx::query_scalar("SELECT course_id FROM entitlements WHERE account_id = ?1")
                .bind(id.0)
                .fetch_all(&mut *self.tx)
                .await?;

        Ok(Some(Account {
            id,
            profile: Profile {
                email: row.try_get("email")?,
                username: row.try_get("username")?,
                first_name: row.try_get("first_name")?,
                last_name: row.try_get("last_name")?,
            },
            is_staff: row.try_get("is_staff")?,
            is_superuser: row.try_get("is_superuser")?,
            cash_balance: to_u64(cash, "cash")?,
            entitled_course_ids: entitlements.into_iter().map(CourseId).collect(),
        }))
    }

    async fn list_accounts(&mut self) -> StoreResult<Vec<Account>> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM accounts ORDER BY id DESC")
            .fetch_all(&mut *self.tx)
            .await?;

        let mut accounts = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(account) = self.get_account(AccountId(id)).await? {
                accounts.push(account);
            }
        }
        Ok(accounts)
    }

    async fn count_accounts(&mut self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM accounts")
            .fetch_one(&mut *self.tx)
            .await?;
        to_u64(count, "count")
    }

    async fn update_balance(
        &mut self,
        id: AccountId,
        expected: u64,
        new_balance: u64,
    ) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE balances SET cash = ?1 WHERE account_id = ?2 AND cash = ?3")
                .bind(to_i64(new_balance, "cash")?)
                .bind(id.0)
                .bind(to_i64(expected, "cash")?)
                .execute(&mut *self.tx)
                .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let current: Option<i64> =
            sqlx::query_scalar("SELECT cash FROM balances WHERE account_id = ?1")
                .bind(id.0)
                .fetch_optional(&mut *self.tx)
                .await?;
        match current {
            None => Err(StoreError::Missing {
                entity: "balance",
                id: id.0,
            }),
            Some(cash) => Err(StoreError::Conflict {
                reason: format!("balance of account {id} changed from {expected} to {cash}"),
            }),
        }
    }

    async fn add_entitlement(&mut self, id: AccountId, course: CourseId) -> StoreResult<()> {
        sqlx::query("INSERT INTO entitlements (account_id, course_id) VALUES (?1, ?2)")
            .bind(id.0)
            .bind(course.0)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                conflict_on_unique(e, || format!("account {id} already owns course {course}"))
            })?;
        Ok(())
    }

    async fn count_students(&mut self, course: CourseId) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entitlements WHERE course_id = ?1")
            .bind(course.0)
            .fetch_one(&mut *self.tx)
            .await?;
        to_u64(count, "count")
    }
}

#[async_trait]
impl CourseStore for SqliteTx {
    async fn insert_course(&mut self, course: &NewCourse) -> StoreResult<Course> {
        let start_date = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO courses (author_id, title, start_date, price)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(course.author.0)
        .bind(&course.title)
        .bind(start_date.to_rfc3339())
        .bind(to_i64(course.price, "price")?)
        .execute(&mut *self.tx)
        .await?;

        Ok(Course {
            id: CourseId(result.last_insert_rowid()),
            author: course.author,
            title: course.title.clone(),
            start_date,
            price: course.price,
        })
    }

    async fn get_course(&mut self, id: CourseId) -> StoreResult<Option<Course>> {
        let row = sqlx::query(
            "SELECT id, author_id, title, start_date, price FROM courses WHERE id = ?1",
        )
        .bind(id.0)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(course_from_row).transpose()
    }

    async fn list_courses(&mut self) -> StoreResult<Vec<Course>> {
        let rows = sqlx::query(
            "SELECT id, author_id, title, start_date, price FROM courses ORDER BY id DESC",
        )
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter().map(course_from_row).collect()
    }

    async fn update_course(
        &mut self,
        id: CourseId,
        changes: &CourseChanges,
    ) -> StoreResult<Option<Course>> {
        if let Some(title) = &changes.title {
            sqlx::query("UPDATE courses SET title = ?1 WHERE id = ?2")
                .bind(title)
                .bind(id.0)
                .execute(&mut *self.tx)
                .await?;
        }
        if let Some(price) = changes.price {
            sqlx::query("UPDATE courses SET price = ?1 WHERE id = ?2")
                .bind(to_i64(price, "price")?)
                .bind(id.0)
                .execute(&mut *self.tx)
                .await?;
        }
        self.get_course(id).await
    }

    async fn delete_course(&mut self, id: CourseId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM courses WHERE id = ?1")
            .bind(id.0)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl GroupStore for SqliteTx {
    async fn bulk_create_groups(&mut self, groups: &[NewGroup]) -> StoreResult<Vec<Group>> {
        let mut created = Vec::with_capacity(groups.len());
        for group in groups {
            let result = sqlx::query("INSERT INTO course_groups (course_id, title) VALUES (?1, ?2)")
                .bind(group.course.0)
                .bind(&group.title)
                .execute(&mut *self.tx)
                .await?;
            created.push(Group {
                id: GroupId(result.last_insert_rowid()),
                course: group.course,
                title: group.title.clone(),
                members: BTreeSet::new(),
            });
        }
        Ok(created)
    }

    async fn list_groups_by_course(&mut self, course: CourseId) -> StoreResult<Vec<Group>> {
        let rows = sqlx::query("SELECT id, title FROM course_groups WHERE course_id = ?1 ORDER BY id ASC")
            .bind(course.0)
            .fetch_all(&mut *self.tx)
            .await?;

        let member_rows = sqlx::query(
            r#"
            SELECT gm.group_id, gm.account_id
            FROM group_members gm
            JOIN course_groups g ON g.id = gm.group_id
            WHERE g.course_id = ?1
            "#,
        )
        .bind(course.0)
        .fetch_all(&mut *self.tx)
        .await?;

        let mut members: BTreeMap<i64, BTreeSet<AccountId>> = BTreeMap::new();
        for row in &member_rows {
            let group_id: i64 = row.try_get("group_id")?;
            let account_id: i64 = row.try_get("account_id")?;
            members
                .entry(group_id)
                .or_default()
                .insert(AccountId(account_id));
        }

        rows.iter()
            .map(|row| -> StoreResult<Group> {
                let id: i64 = row.try_get("id")?;
                Ok(Group {
                    id: GroupId(id),
                    course,
                    title: row.try_get("title")?,
                    members: members.remove(&id).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn get_group(&mut self, id: GroupId) -> StoreResult<Option<Group>> {
        let row = sqlx::query("SELECT id, course_id, title FROM course_groups WHERE id = ?1")
            .bind(id.0)
            .fetch_optional(&mut *self.tx)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let course = CourseId(row.try_get("course_id")?);
        let title: String = row.try_get("title")?;
        let members = self.members_of(id).await?;

        Ok(Some(Group {
            id,
            course,
            title,
            members,
        }))
    }

    async fn add_member(&mut self, group: GroupId, account: AccountId) -> StoreResult<()> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM course_groups WHERE id = ?1")
            .bind(group.0)
            .fetch_optional(&mut *self.tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::Missing {
                entity: "group",
                id: group.0,
            });
        }

        let already: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM group_members WHERE group_id = ?1 AND account_id = ?2",
        )
        .bind(group.0)
        .bind(account.0)
        .fetch_optional(&mut *self.tx)
        .await?;
        if already.is_some() {
            return Ok(());
        }

        // Capacity check and insert in a single statement
        let result = sqlx::query(
            r#"
            INSERT INTO group_members (group_id, account_id)
            SELECT ?1, ?2
            WHERE (SELECT COUNT(*) FROM group_members WHERE group_id = ?1) < ?3
            "#,
        )
        .bind(group.0)
        .bind(account.0)
        .bind(GROUP_CAPACITY as i64)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                reason: format!("group {group} is full"),
            });
        }
        Ok(())
    }

    async fn delete_group(&mut self, id: GroupId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM course_groups WHERE id = ?1")
            .bind(id.0)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl LessonStore for SqliteTx {
    async fn insert_lesson(
        &mut self,
        course: CourseId,
        lesson: &NewLesson,
    ) -> StoreResult<Lesson> {
        let result = sqlx::query("INSERT INTO lessons (course_id, title, link) VALUES (?1, ?2, ?3)")
            .bind(course.0)
            .bind(&lesson.title)
            .bind(&lesson.link)
            .execute(&mut *self.tx)
            .await?;

        Ok(Lesson {
            id: LessonId(result.last_insert_rowid()),
            course,
            title: lesson.title.clone(),
            link: lesson.link.clone(),
        })
    }

    async fn list_lessons_by_course(&mut self, course: CourseId) -> StoreResult<Vec<Lesson>> {
        let rows = sqlx::query(
            "SELECT id, course_id, title, link FROM lessons WHERE course_id = ?1 ORDER BY id ASC",
        )
        .bind(course.0)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter().map(lesson_from_row).collect()
    }

    async fn get_lesson(&mut self, id: LessonId) -> StoreResult<Option<Lesson>> {
        let row = sqlx::query("SELECT id, course_id, title, link FROM lessons WHERE id = ?1")
            .bind(id.0)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.as_ref().map(lesson_from_row).transpose()
    }

    async fn delete_lesson(&mut self, id: LessonId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM lessons WHERE id = ?1")
            .bind(id.0)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
