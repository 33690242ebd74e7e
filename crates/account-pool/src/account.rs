//! Account record and its status state machine
//!
//! Transitions (all applied under the owning pool's write lock):
//! - Available → InUse (dequeued by `get_next`)
//! - InUse → Available (returned, or failed with retry budget left)
//! - InUse → Completed (successful result)
//! - InUse → Failed (failed with retry disabled or budget spent)
//! - Skipped is set by external tooling only and arrives via discovery

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use account_store::AccountRow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an account within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Available,
    InUse,
    Completed,
    Failed,
    Skipped,
}

impl AccountStatus {
    /// Status label for logging and the store's `status` column.
    pub fn label(&self) -> &'static str {
        match self {
            AccountStatus::Available => "available",
            AccountStatus::InUse => "in_use",
            AccountStatus::Completed => "completed",
            AccountStatus::Failed => "failed",
            AccountStatus::Skipped => "skipped",
        }
    }

    /// Parse a stored status label. Case-insensitive; unknown labels yield `None`.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "available" | "" => Some(AccountStatus::Available),
            "in_use" | "inuse" | "in-use" => Some(AccountStatus::InUse),
            "completed" | "used" => Some(AccountStatus::Completed),
            "failed" => Some(AccountStatus::Failed),
            "skipped" => Some(AccountStatus::Skipped),
            _ => None,
        }
    }
}

/// Outcome a worker attaches when it finishes with an account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountResult {
    pub success: bool,
    pub packs_opened: u32,
    pub cards_found: u32,
    pub kept: u32,
    pub duration: Duration,
    pub error: Option<String>,
}

impl AccountResult {
    pub fn success(packs_opened: u32, duration: Duration) -> Self {
        Self {
            success: true,
            packs_opened,
            duration,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Retry policy slice of `PoolConfig`, passed to the transition methods.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub retry_failed: bool,
    pub max_failures: u32,
}

/// What a recorded outcome did to the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    Requeued,
    Failed,
}

impl Outcome {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Requeued => "requeued",
            Outcome::Failed => "failed",
        }
    }
}

/// One allocatable account.
///
/// Values handed to callers are snapshots; the pool's copy is the only one
/// that transitions. Callers identify accounts by `id` when reporting back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Account {
    pub id: String,
    pub file_path: PathBuf,
    pub packs: u32,
    pub last_modified: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,

    pub status: AccountStatus,
    pub assigned_at: Option<DateTime<Utc>>,
    /// Worker holding the account; 0 when unassigned.
    pub assigned_to: u32,
    pub processed_at: Option<DateTime<Utc>>,
    pub result: Option<AccountResult>,
    pub failure_count: u32,
    pub last_error: String,
}

impl Account {
    /// A freshly discovered, unassigned account.
    pub fn new(id: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            file_path: file_path.into(),
            packs: 0,
            last_modified: None,
            metadata: HashMap::new(),
            status: AccountStatus::Available,
            assigned_at: None,
            assigned_to: 0,
            processed_at: None,
            result: None,
            failure_count: 0,
            last_error: String::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == AccountStatus::Available
    }

    pub(crate) fn check_out(&mut self, worker_id: u32, now: DateTime<Utc>) {
        self.status = AccountStatus::InUse;
        self.assigned_at = Some(now);
        self.assigned_to = worker_id;
    }

    /// Back to Available with assignment cleared, whatever the prior status.
    pub(crate) fn release(&mut self) {
        self.status = AccountStatus::Available;
        self.clear_assignment();
    }

    pub(crate) fn record_result(
        &mut self,
        result: AccountResult,
        policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Outcome {
        let success = result.success;
        let reason = result
            .error
            .clone()
            .unwrap_or_else(|| "run reported failure".to_string());
        self.result = Some(result);

        if success {
            self.processed_at = Some(now);
            self.status = AccountStatus::Completed;
            self.clear_assignment();
            Outcome::Completed
        } else {
            self.record_failure(&reason, policy, now)
        }
    }

    pub(crate) fn record_failure(
        &mut self,
        reason: &str,
        policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Outcome {
        self.failure_count += 1;
        self.last_error = reason.to_string();
        self.processed_at = Some(now);
        self.clear_assignment();

        if policy.retry_failed && self.failure_count < policy.max_failures {
            self.status = AccountStatus::Available;
            Outcome::Requeued
        } else {
            self.status = AccountStatus::Failed;
            Outcome::Failed
        }
    }

    /// Carry lifecycle state from the in-memory copy onto a rediscovered one.
    ///
    /// Payload fields (path, packs, timestamps, metadata) stay as discovered.
    pub(crate) fn adopt_lifecycle(&mut self, previous: &Account) {
        self.status = previous.status;
        self.assigned_at = previous.assigned_at;
        self.assigned_to = previous.assigned_to;
        self.processed_at = previous.processed_at;
        self.result = previous.result.clone();
        self.failure_count = self.failure_count.max(previous.failure_count);
        self.last_error = previous.last_error.clone();
    }

    fn clear_assignment(&mut self) {
        self.assigned_at = None;
        self.assigned_to = 0;
    }
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        // Nobody in this process holds a row the store calls in_use.
        let status = match AccountStatus::from_label(&row.status) {
            Some(AccountStatus::InUse) | None => AccountStatus::Available,
            Some(status) => status,
        };
        let mut account = Account::new(row.id, row.path);
        account.packs = row.packs;
        account.last_modified = row.last_modified;
        account.status = status;
        account.failure_count = row.failures;
        account.last_error = row.last_error;
        if let Some(device_account) = row.device_account {
            account
                .metadata
                .insert("device_account".to_string(), device_account);
        }
        account
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETRY_THREE: RetryPolicy = RetryPolicy {
        retry_failed: true,
        max_failures: 3,
    };

    fn checked_out() -> Account {
        let mut account = Account::new("a", "/tmp/a.xml");
        account.check_out(7, Utc::now());
        account
    }

    #[test]
    fn check_out_and_release_keep_invariants() {
        let mut account = checked_out();
        assert_eq!(account.status, AccountStatus::InUse);
        assert!(account.assigned_at.is_some());
        assert_eq!(account.assigned_to, 7);

        account.release();
        assert_eq!(account.status, AccountStatus::Available);
        assert_eq!(account.assigned_at, None);
        assert_eq!(account.assigned_to, 0);
    }

    #[test]
    fn success_completes_with_current_timestamp() {
        let mut account = checked_out();
        let now = Utc::now();
        let outcome = account.record_result(
            AccountResult::success(5, Duration::from_secs(30)),
            RETRY_THREE,
            now,
        );
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(account.status, AccountStatus::Completed);
        assert_eq!(account.processed_at, Some(now));
        assert_ne!(
            account.processed_at,
            Some(DateTime::<Utc>::UNIX_EPOCH),
            "processed_at must be the completion time, not the epoch"
        );
        assert_eq!(account.assigned_to, 0);
    }

    #[test]
    fn failures_requeue_until_budget_spent() {
        let mut account = checked_out();
        for attempt in 1..=2 {
            let outcome = account.record_failure("timeout", RETRY_THREE, Utc::now());
            assert_eq!(outcome, Outcome::Requeued, "attempt {attempt}");
            assert_eq!(account.status, AccountStatus::Available);
            account.check_out(7, Utc::now());
        }
        let outcome = account.record_failure("timeout", RETRY_THREE, Utc::now());
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(account.status, AccountStatus::Failed);
        assert_eq!(account.failure_count, 3);
        assert_eq!(account.last_error, "timeout");
    }

    #[test]
    fn retry_disabled_fails_immediately() {
        let mut account = checked_out();
        let policy = RetryPolicy {
            retry_failed: false,
            max_failures: 3,
        };
        let outcome = account.record_result(AccountResult::failure("banned"), policy, Utc::now());
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(account.failure_count, 1);
        assert_eq!(account.last_error, "banned");
        assert!(account.result.is_some());
    }

    #[test]
    fn adopt_lifecycle_keeps_payload_from_discovery() {
        let previous = checked_out();
        let mut rediscovered = Account::new("a", "/new/a.xml");
        rediscovered.packs = 12;
        rediscovered.adopt_lifecycle(&previous);

        assert_eq!(rediscovered.status, AccountStatus::InUse);
        assert_eq!(rediscovered.assigned_to, 7);
        assert_eq!(rediscovered.file_path, PathBuf::from("/new/a.xml"));
        assert_eq!(rediscovered.packs, 12);
    }

    #[test]
    fn row_status_in_use_enters_available() {
        let row = AccountRow {
            id: "42".into(),
            device_account: Some("dev-42".into()),
            path: "/s/dev-42.xml".into(),
            packs: 3,
            last_modified: None,
            status: "in_use".into(),
            failures: 1,
            last_error: "crash".into(),
        };
        let account = Account::from(row);
        assert_eq!(account.status, AccountStatus::Available);
        assert_eq!(account.failure_count, 1);
        assert_eq!(account.metadata["device_account"], "dev-42");
    }

    #[test]
    fn status_labels_round_trip() {
        for status in [
            AccountStatus::Available,
            AccountStatus::InUse,
            AccountStatus::Completed,
            AccountStatus::Failed,
            AccountStatus::Skipped,
        ] {
            assert_eq!(AccountStatus::from_label(status.label()), Some(status));
        }
        assert_eq!(AccountStatus::from_label("bogus"), None);
    }
}
