// Billing ledger
//
// Minutes balances, trial consumption and trial-to-user binding. All
// mutations go through the store's conditional updates, so concurrent
// settlement is linearizable and balances never go negative.

use std::sync::Arc;

use log::{debug, info};

use crate::store::{sqlite::SqliteStore, BalanceStore, TrialStore};

/// Ledger over balances and trial accounting.
#[derive(Clone)]
pub struct BillingLedger {
    store: Arc<SqliteStore>,
}

impl BillingLedger {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    /// Deduct `minutes` from a user's balance.
    ///
    /// Returns false without mutating when the balance is too small; the
    /// caller decides what a shortfall means (admission refuses, settlement
    /// logs and moves on).
    pub async fn deduct(&self, user_id: &str, minutes: i64) -> Result<bool, sqlx::Error> {
        if minutes <= 0 {
            return Ok(true);
        }
        let ok = self.store.deduct_minutes(user_id, minutes).await?;
        debug!(
            "deduct {} minutes from {}: {}",
            minutes,
            user_id,
            if ok { "ok" } else { "insufficient" }
        );
        Ok(ok)
    }

    /// Credit minutes, creating the balance row if needed.
    pub async fn add(&self, user_id: &str, minutes: i64) -> Result<(), sqlx::Error> {
        self.store.add_minutes(user_id, minutes).await?;
        info!("credited {} minutes to {}", minutes, user_id);
        Ok(())
    }

    /// Current balance in minutes; absent rows read as zero.
    pub async fn balance_minutes(&self, user_id: &str) -> Result<i64, sqlx::Error> {
        Ok(self
            .store
            .get_balance(user_id)
            .await?
            .map(|b| b.minutes_balance)
            .unwrap_or(0))
    }

    /// Create the zero balance row for a freshly registered user.
    pub async fn on_user_registered(&self, user_id: &str) -> Result<(), sqlx::Error> {
        self.store.ensure_balance(user_id).await
    }

    /// Register an anon token the first time an anonymous caller shows up
    /// for a trial.
    pub async fn ensure_anon_token(
        &self,
        anon_id: &str,
        ip_hash: Option<&str>,
        ua_hash: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        self.store.ensure_anon_token(anon_id, ip_hash, ua_hash).await
    }

    /// True when the caller has already consumed a trial.
    pub async fn check_trial(
        &self,
        user_id: Option<&str>,
        anon_id: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        self.store.has_used_trial(user_id, anon_id).await
    }

    /// Record a consumed trial: append the audit row and flip the anon
    /// token. Both writes are idempotent under retry.
    pub async fn record_trial(
        &self,
        user_id: Option<&str>,
        anon_id: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        self.store.append_trial_usage(user_id, anon_id).await?;
        if let Some(anon_id) = anon_id {
            self.store.mark_trial_used(anon_id).await?;
        }
        info!(
            "trial consumed (user: {:?}, anon: {:?})",
            user_id, anon_id
        );
        Ok(())
    }

    /// On signup of a trial user, attribute their anonymous usage to the new
    /// user id so the trial stays consumed.
    pub async fn bind_trial_to_user(
        &self,
        user_id: &str,
        anon_id: &str,
    ) -> Result<u64, sqlx::Error> {
        self.store.ensure_balance(user_id).await?;
        let moved = self.store.bind_trials_to_user(user_id, anon_id).await?;
        if moved > 0 {
            info!("bound {} trial usage rows from {} to {}", moved, anon_id, user_id);
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;

    async fn ledger() -> BillingLedger {
        BillingLedger::new(Arc::new(SqliteStore::connect_in_memory().await.unwrap()))
    }

    #[tokio::test]
    async fn deduct_respects_balance_guard() {
        let ledger = ledger().await;
        ledger.add("u1", 5).await.unwrap();

        assert!(ledger.deduct("u1", 3).await.unwrap());
        assert!(!ledger.deduct("u1", 3).await.unwrap());
        assert_eq!(ledger.balance_minutes("u1").await.unwrap(), 2);

        // Zero-cost deductions always succeed without touching the row.
        assert!(ledger.deduct("u1", 0).await.unwrap());
        assert_eq!(ledger.balance_minutes("u1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn deduct_for_unknown_user_fails_closed() {
        let ledger = ledger().await;
        assert!(!ledger.deduct("ghost", 1).await.unwrap());
        assert_eq!(ledger.balance_minutes("ghost").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn trial_lifecycle() {
        let ledger = ledger().await;
        ledger
            .ensure_anon_token("a1", Some("ip"), Some("ua"))
            .await
            .unwrap();

        assert!(!ledger.check_trial(None, Some("a1")).await.unwrap());
        ledger.record_trial(None, Some("a1")).await.unwrap();
        assert!(ledger.check_trial(None, Some("a1")).await.unwrap());

        // Signup: usage follows the user; the new user also gets a zero
        // balance row.
        ledger.bind_trial_to_user("u1", "a1").await.unwrap();
        assert!(ledger.check_trial(Some("u1"), None).await.unwrap());
        assert_eq!(ledger.balance_minutes("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn registration_creates_zero_balance_once() {
        let ledger = ledger().await;
        ledger.on_user_registered("u1").await.unwrap();
        ledger.add("u1", 10).await.unwrap();
        // A second registration must not reset the balance.
        ledger.on_user_registered("u1").await.unwrap();
        assert_eq!(ledger.balance_minutes("u1").await.unwrap(), 10);
    }
}
