//! Purchase-and-enroll workflow.
//!
//! Enrolling an account into a course debits the course price from the account
//! balance, records the purchase and seats the account in the first group of the
//! course that still has a free seat. The three writes share one store
//! transaction, and attempts for the same (account, course) pair are serialized
//! by [`EnrollmentLocks`].

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};

use crate::domain::{AccountId, Course, CourseId, GroupId};
use crate::observability::{enrollment_metrics, OperationTimer};
use crate::store::{AccountStore, CourseStore, GroupStore, Store, StoreError, Transaction};
use crate::telemetry::{create_enrollment_span, generate_correlation_id};

pub mod locks;

pub use locks::{EnrollmentGuard, EnrollmentLocks};

/// Business failures of an enrollment attempt plus infrastructure errors
#[derive(Debug, Error)]
pub enum EnrollError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Insufficient funds: balance {balance}, price {price}")]
    InsufficientFunds { balance: u64, price: u64 },

    #[error("No free groups for course {course}")]
    NoAvailableGroup { course: CourseId },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Record of a completed purchase
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Enrollment {
    pub account: AccountId,
    pub course: CourseId,
    pub group: GroupId,
    pub price: u64,
    pub balance_after: u64,
}

/// Purchase state of a course the account already owns
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExistingPurchase {
    pub account: AccountId,
    pub course: CourseId,
    pub group: Option<GroupId>,
    pub balance: u64,
}

/// Successful results of [`EnrollmentWorkflow::enroll`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnrollOutcome {
    Enrolled(Enrollment),
    AlreadyOwned(ExistingPurchase),
}

impl EnrollOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, EnrollOutcome::Enrolled(_))
    }
}

pub struct EnrollmentWorkflow<S: Store> {
    store: Arc<S>,
    locks: EnrollmentLocks,
}

impl<S: Store> EnrollmentWorkflow<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            locks: EnrollmentLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Purchase `course` for `account` and seat the account in a group.
    ///
    /// Checks run in order: course exists, account exists, course not yet owned,
    /// balance covers the price, a group has a free seat. Owning the course already
    /// is not an error and returns [`EnrollOutcome::AlreadyOwned`] without writes.
    pub async fn enroll(
        &self,
        account: AccountId,
        course: CourseId,
    ) -> Result<EnrollOutcome, EnrollError> {
        let correlation_id = generate_correlation_id();
        let span = create_enrollment_span(account, course, &correlation_id);

        async move {
            let timer = OperationTimer::new("enroll");
            let result = self.enroll_locked(account, course).await;
            timer.finish();

            let metrics = enrollment_metrics();
            match &result {
                Ok(EnrollOutcome::Enrolled(enrollment)) => {
                    metrics.record_enrolled();
                    info!(
                        group_id = enrollment.group.0,
                        price = enrollment.price,
                        balance_after = enrollment.balance_after,
                        "Enrollment completed"
                    );
                }
                Ok(EnrollOutcome::AlreadyOwned(_)) => {
                    metrics.record_already_owned();
                    info!("Course already owned, nothing to do");
                }
                Err(EnrollError::NotFound(entity)) => {
                    metrics.record_not_found();
                    info!(entity = *entity, "Enrollment target not found");
                }
                Err(EnrollError::InsufficientFunds { balance, price }) => {
                    metrics.record_insufficient_funds();
                    info!(balance = *balance, price = *price, "Insufficient funds");
                }
                Err(EnrollError::NoAvailableGroup { .. }) => {
                    metrics.record_no_available_group();
                    warn!("Every group of the course is full");
                }
                Err(EnrollError::Storage(e)) => {
                    metrics.record_storage_error();
                    warn!(error = %e, "Enrollment aborted by storage error");
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn enroll_locked(
        &self,
        account_id: AccountId,
        course_id: CourseId,
    ) -> Result<EnrollOutcome, EnrollError> {
        let _guard = self.locks.acquire(account_id, course_id).await;
        let mut tx = self.store.begin().await?;

        let course = tx
            .get_course(course_id)
            .await?
            .ok_or(EnrollError::NotFound("course"))?;
        let account = tx
            .get_account(account_id)
            .await?
            .ok_or(EnrollError::NotFound("account"))?;

        let groups = tx.list_groups_by_course(course_id).await?;

        if account.owns(course_id) {
            let group = groups
                .iter()
                .find(|group| group.members.contains(&account_id))
                .map(|group| group.id);
            return Ok(EnrollOutcome::AlreadyOwned(ExistingPurchase {
                account: account_id,
                course: course_id,
                group,
                balance: account.cash_balance,
            }));
        }

        if !account.can_afford(course.price) {
            return Err(EnrollError::InsufficientFunds {
                balance: account.cash_balance,
                price: course.price,
            });
        }

        let group = groups
            .iter()
            .find(|group| group.has_capacity())
            .ok_or(EnrollError::NoAvailableGroup { course: course_id })?;
        debug!(group_id = group.id.0, title = %group.title, "Selected group with free seat");

        let balance_after =
            apply_purchase(&mut tx, account.cash_balance, account_id, &course).await?;
        tx.add_member(group.id, account_id).await?;
        tx.commit().await?;

        Ok(EnrollOutcome::Enrolled(Enrollment {
            account: account_id,
            course: course_id,
            group: group.id,
            price: course.price,
            balance_after,
        }))
    }
}

/// Debit the price and record the entitlement; returns the new balance
async fn apply_purchase<T: Transaction>(
    tx: &mut T,
    balance: u64,
    account: AccountId,
    course: &Course,
) -> Result<u64, EnrollError> {
    let balance_after = balance
        .checked_sub(course.price)
        .ok_or(EnrollError::InsufficientFunds {
            balance,
            price: course.price,
        })?;
    tx.update_balance(account, balance, balance_after).await?;
    tx.add_entitlement(account, course.id).await?;
    Ok(balance_after)
}
