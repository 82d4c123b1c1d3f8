//! In-memory ledger participant
//!
//! Reference participant used by the demo binary and the test suites.
//! Every operation runs under one lock, which serializes conflicting
//! operations the same way a row-locking database would.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    AccountBalanceChange, BalanceCheck, LedgerError, LedgerParticipant, LedgerReceipt, Posting,
    Reversal,
};
use crate::activity::Heartbeat;
use crate::currency::Currency;

/// Account lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Inactive,
    Blocked,
    Closed,
}

#[derive(Debug, Clone)]
struct Account {
    currency: Currency,
    balance: i64,
    status: AccountStatus,
}

/// Kind of journal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    Debit,
    Credit,
    CompensateDebit,
}

/// One row of the participant's transaction journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub tx_id: String,
    pub kind: LedgerEntryKind,
    pub account: String,
    pub amount: i64,
    pub currency: Currency,
    pub idempotency_key: String,
    pub reference: String,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Book {
    accounts: HashMap<String, Account>,
    /// idempotency_key -> recorded outcome (success or error)
    processed: HashMap<String, Result<LedgerReceipt, LedgerError>>,
    journal: Vec<LedgerEntry>,
    /// tx_id -> journal index
    by_tx: HashMap<String, usize>,
    /// Debit tx_ids that already have a reversal
    reversed: HashSet<String>,
    changes: Vec<AccountBalanceChange>,
}

impl Book {
    fn account(&self, id: &str) -> Result<&Account, LedgerError> {
        self.accounts
            .get(id)
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))
    }

    fn check_currency(id: &str, account: &Account, currency: Currency) -> Result<(), LedgerError> {
        if account.currency != currency {
            return Err(LedgerError::InvalidCurrency {
                account: id.to_string(),
                expected: account.currency.to_string(),
                got: currency.to_string(),
            });
        }
        Ok(())
    }

    fn require_active(id: &str, account: &Account) -> Result<(), LedgerError> {
        match account.status {
            AccountStatus::Active => Ok(()),
            AccountStatus::Blocked => Err(LedgerError::AccountBlocked(id.to_string())),
            AccountStatus::Inactive | AccountStatus::Closed => {
                Err(LedgerError::AccountInactive(id.to_string()))
            }
        }
    }

    fn post_debit(&mut self, posting: &Posting<'_>) -> Result<LedgerReceipt, LedgerError> {
        let acc = self.account(posting.account)?;
        Self::require_active(posting.account, acc)?;
        Self::check_currency(posting.account, acc, posting.currency)?;
        if acc.balance < posting.amount {
            return Err(LedgerError::InsufficientFunds {
                account: posting.account.to_string(),
                balance: acc.balance,
                requested: posting.amount,
            });
        }
        self.apply(
            LedgerEntryKind::Debit,
            posting.account,
            -posting.amount,
            posting.currency,
            posting.idempotency_key,
            posting.reference,
            "transfer_debit",
            BTreeMap::new(),
        )
    }

    fn post_credit(&mut self, posting: &Posting<'_>) -> Result<LedgerReceipt, LedgerError> {
        let acc = self.account(posting.account)?;
        Self::require_active(posting.account, acc)?;
        Self::check_currency(posting.account, acc, posting.currency)?;
        self.apply(
            LedgerEntryKind::Credit,
            posting.account,
            posting.amount,
            posting.currency,
            posting.idempotency_key,
            posting.reference,
            "transfer_credit",
            BTreeMap::new(),
        )
    }

    fn post_reversal(&mut self, reversal: &Reversal<'_>) -> Result<LedgerReceipt, LedgerError> {
        let acc = self.account(reversal.account)?;
        // Reversals land on blocked or inactive accounts; only closed ones refuse.
        if acc.status == AccountStatus::Closed {
            return Err(LedgerError::AccountClosed(reversal.account.to_string()));
        }
        Self::check_currency(reversal.account, acc, reversal.currency)?;
        self.reversible_debit(reversal)?;

        let mut metadata = BTreeMap::new();
        metadata.insert("compensation".to_string(), "true".to_string());
        metadata.insert(
            "original_transaction_id".to_string(),
            reversal.original_tx_id.to_string(),
        );
        metadata.insert(
            "compensation_reason".to_string(),
            reversal.reason.to_string(),
        );

        let receipt = self.apply(
            LedgerEntryKind::CompensateDebit,
            reversal.account,
            reversal.amount,
            reversal.currency,
            reversal.idempotency_key,
            reversal.original_tx_id,
            "compensation",
            metadata,
        )?;
        self.reversed.insert(reversal.original_tx_id.to_string());
        Ok(receipt)
    }

    /// The reversal must undo exactly one recorded debit of this account
    fn reversible_debit(&self, reversal: &Reversal<'_>) -> Result<(), LedgerError> {
        let original = self
            .by_tx
            .get(reversal.original_tx_id)
            .and_then(|&i| self.journal.get(i))
            .ok_or_else(|| LedgerError::TransactionNotFound(reversal.original_tx_id.to_string()))?;

        let mismatch = |reason: String| LedgerError::ReversalMismatch {
            original_tx_id: reversal.original_tx_id.to_string(),
            reason,
        };
        if original.kind != LedgerEntryKind::Debit {
            return Err(mismatch(format!("{:?} is not a debit", original.kind)));
        }
        if original.account != reversal.account {
            return Err(mismatch(format!("debit was on account {}", original.account)));
        }
        if original.amount != reversal.amount || original.currency != reversal.currency {
            return Err(mismatch(format!(
                "debit was {} {}",
                original.amount, original.currency
            )));
        }
        if self.reversed.contains(reversal.original_tx_id) {
            return Err(LedgerError::AlreadyReversed(
                reversal.original_tx_id.to_string(),
            ));
        }
        Ok(())
    }

    /// Apply a balance delta and journal it
    #[allow(clippy::too_many_arguments)]
    fn apply(
        &mut self,
        kind: LedgerEntryKind,
        account_id: &str,
        delta: i64,
        currency: Currency,
        key: &str,
        reference: &str,
        reason: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<LedgerReceipt, LedgerError> {
        let tx_id = format!("ltx_{}", ulid::Ulid::new());
        let now = Utc::now();

        let account = self
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;
        let previous_balance = account.balance;
        let new_balance = previous_balance
            .checked_add(delta)
            .ok_or_else(|| LedgerError::BalanceOverflow(account_id.to_string()))?;
        account.balance = new_balance;

        self.by_tx.insert(tx_id.clone(), self.journal.len());
        self.journal.push(LedgerEntry {
            tx_id: tx_id.clone(),
            kind,
            account: account_id.to_string(),
            amount: delta.abs(),
            currency,
            idempotency_key: key.to_string(),
            reference: reference.to_string(),
            metadata,
            created_at: now,
        });
        self.changes.push(AccountBalanceChange {
            account_id: account_id.to_string(),
            previous_balance,
            new_balance,
            delta,
            reason: reason.to_string(),
            caused_by_tx_id: tx_id.clone(),
        });

        Ok(LedgerReceipt {
            tx_id,
            previous_balance,
            new_balance,
            completed_at: now,
        })
    }
}

/// In-memory ledger participant
#[derive(Default)]
pub struct InMemoryLedger {
    book: Mutex<Book>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or reset) an account
    pub fn open_account(&self, id: &str, currency: Currency, balance: i64) {
        let mut book = self.lock();
        book.accounts.insert(
            id.to_string(),
            Account {
                currency,
                balance,
                status: AccountStatus::Active,
            },
        );
    }

    /// Change the lifecycle status of an existing account
    pub fn set_status(&self, id: &str, status: AccountStatus) -> Result<(), LedgerError> {
        let mut book = self.lock();
        let account = book
            .accounts
            .get_mut(id)
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))?;
        account.status = status;
        Ok(())
    }

    pub fn balance(&self, id: &str) -> Option<i64> {
        self.lock().accounts.get(id).map(|a| a.balance)
    }

    /// Snapshot of the transaction journal
    pub fn journal(&self) -> Vec<LedgerEntry> {
        self.lock().journal.clone()
    }

    /// Journal entries for one account and kind
    pub fn entries_for(&self, account: &str, kind: LedgerEntryKind) -> Vec<LedgerEntry> {
        self.lock()
            .journal
            .iter()
            .filter(|e| e.account == account && e.kind == kind)
            .cloned()
            .collect()
    }

    /// Balance-change evidence, oldest first
    pub fn balance_changes(&self) -> Vec<AccountBalanceChange> {
        self.lock().changes.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Book> {
        // A poisoned book still holds consistent data: every mutation is a
        // single non-panicking block.
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replay a previously recorded outcome, if this key was seen before
    fn replay(book: &Book, key: &str) -> Option<Result<LedgerReceipt, LedgerError>> {
        let hit = book.processed.get(key).cloned();
        if hit.is_some() {
            debug!(idempotency_key = key, "Ledger operation already processed");
        }
        hit
    }

    /// Record a final outcome; transient errors are never memoized
    fn remember(book: &mut Book, key: &str, result: &Result<LedgerReceipt, LedgerError>) {
        if !matches!(result, Err(LedgerError::Transient(_))) {
            book.processed.insert(key.to_string(), result.clone());
        }
    }
}

#[async_trait]
impl LedgerParticipant for InMemoryLedger {
    fn name(&self) -> &'static str {
        "in-memory-ledger"
    }

    async fn check_balance(
        &self,
        account: &str,
        amount: i64,
        currency: Currency,
        heartbeat: &Heartbeat,
    ) -> Result<BalanceCheck, LedgerError> {
        heartbeat.beat();
        let book = self.lock();
        let acc = book.account(account)?;
        if acc.status == AccountStatus::Blocked {
            return Err(LedgerError::AccountBlocked(account.to_string()));
        }
        Book::check_currency(account, acc, currency)?;

        Ok(BalanceCheck {
            sufficient_funds: acc.balance >= amount,
            current_balance: acc.balance,
            currency: acc.currency,
            status: acc.status,
        })
    }

    async fn debit(
        &self,
        posting: &Posting<'_>,
        heartbeat: &Heartbeat,
    ) -> Result<LedgerReceipt, LedgerError> {
        heartbeat.beat();
        let mut book = self.lock();
        if let Some(result) = Self::replay(&book, posting.idempotency_key) {
            return result;
        }

        let result = book.post_debit(posting);
        if let Err(e) = &result {
            warn!(account = posting.account, error = %e, "Debit rejected");
        }
        Self::remember(&mut book, posting.idempotency_key, &result);
        result
    }

    async fn credit(
        &self,
        posting: &Posting<'_>,
        heartbeat: &Heartbeat,
    ) -> Result<LedgerReceipt, LedgerError> {
        heartbeat.beat();
        let mut book = self.lock();
        if let Some(result) = Self::replay(&book, posting.idempotency_key) {
            return result;
        }

        let result = book.post_credit(posting);
        if let Err(e) = &result {
            warn!(account = posting.account, error = %e, "Credit rejected");
        }
        Self::remember(&mut book, posting.idempotency_key, &result);
        result
    }

    async fn compensate_debit(
        &self,
        reversal: &Reversal<'_>,
        heartbeat: &Heartbeat,
    ) -> Result<LedgerReceipt, LedgerError> {
        heartbeat.beat();
        let mut book = self.lock();
        if let Some(result) = Self::replay(&book, reversal.idempotency_key) {
            return result;
        }

        let result = book.post_reversal(reversal);
        if let Err(e) = &result {
            warn!(account = reversal.account, error = %e, "Compensation rejected");
        }
        Self::remember(&mut book, reversal.idempotency_key, &result);
        result
    }
}
