use std::sync::Arc;

use chrono::Duration;
use spectra_core::config::AccountConfig;
use spectra_core::Clock;
use spectra_gateway::GatewayError;
use spectra_store::{AccountHealth, Store};
use tracing::{info, warn};

use crate::error::Result;

/// Cooldown applied when an account hits the joined-channels capacity cap.
const CHANNELS_TOO_MUCH_COOLDOWN_HOURS: i64 = 24;

/// Persistent per-account usage, cooldown, ban and success/error counters.
/// Outcomes are classified from the gateway error so callers never decide
/// ban/cooldown policy themselves.
pub struct AccountRegistry {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl AccountRegistry {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Make sure a row exists for this account; existing counters survive.
    pub fn register(&self, account: &AccountConfig) -> Result<()> {
        self.store.ensure_account(
            &account.session_handle,
            account.api_id,
            account.phone.as_deref(),
        )?;
        Ok(())
    }

    pub fn health(&self, session_handle: &str) -> Result<Option<AccountHealth>> {
        Ok(self.store.account(session_handle)?)
    }

    /// All accounts in registration order.
    pub fn all(&self) -> Result<Vec<AccountHealth>> {
        Ok(self.store.accounts()?)
    }

    pub fn mark_success(&self, session_handle: &str) -> Result<()> {
        self.store.record_account_success(session_handle)?;
        Ok(())
    }

    /// Record a failure. The cooldown is the explicit override when given,
    /// otherwise derived from the error class (flood-wait seconds, 24 h for
    /// the channel-capacity cap). Account-fatal auth errors ban the account.
    pub fn mark_failure(
        &self,
        session_handle: &str,
        error: &GatewayError,
        cooldown_hours: Option<f64>,
    ) -> Result<()> {
        let now = self.clock.now();
        let flood = error.flood_wait_seconds().is_some();
        let banned = error.is_account_fatal();

        let cooldown_until = if let Some(hours) = cooldown_hours {
            Some(now + Duration::seconds((hours * 3600.0) as i64))
        } else if let Some(seconds) = error.flood_wait_seconds() {
            Some(now + Duration::seconds(seconds as i64))
        } else if matches!(error, GatewayError::ChannelsTooMuch) {
            Some(now + Duration::hours(CHANNELS_TOO_MUCH_COOLDOWN_HOURS))
        } else {
            None
        };

        self.store.record_account_failure(
            session_handle,
            error.kind(),
            cooldown_until,
            flood,
            banned,
        )?;

        if banned {
            warn!(account = %session_handle, error = %error, "account marked banned");
        } else {
            info!(
                account = %session_handle,
                error = %error,
                cooldown = ?cooldown_until,
                "account failure recorded"
            );
        }
        Ok(())
    }

    /// Record a non-gateway failure: last-error text only, no cooldown and
    /// no ban.
    pub fn note_failure(&self, session_handle: &str, error_text: &str) -> Result<()> {
        self.store
            .record_account_failure(session_handle, error_text, None, false, false)?;
        Ok(())
    }

    /// Persist a selection (usage bump + last-used stamp).
    pub fn record_selection(&self, session_handle: &str) -> Result<()> {
        self.store
            .record_account_selection(session_handle, self.clock.now())?;
        Ok(())
    }

    /// Zero usage counters for non-banned accounts.
    pub fn reset_usage_counts(&self) -> Result<()> {
        self.store.reset_usage_counts()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use spectra_core::ManualClock;

    fn account(handle: &str) -> AccountConfig {
        AccountConfig {
            api_id: 1,
            api_hash: "hash".into(),
            session_handle: handle.into(),
            phone: None,
            password: None,
        }
    }

    fn registry() -> (AccountRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(Store::open_in_memory().unwrap());
        (AccountRegistry::new(store, clock.clone()), clock)
    }

    #[test]
    fn flood_wait_sets_cooldown_and_counter() {
        let (reg, clock) = registry();
        reg.register(&account("alpha")).unwrap();

        reg.mark_failure("alpha", &GatewayError::FloodWait { seconds: 30 }, None)
            .unwrap();

        let h = reg.health("alpha").unwrap().unwrap();
        assert_eq!(h.flood_wait_count, 1);
        assert!(!h.is_banned);
        let until = h.cooldown_until.unwrap();
        assert_eq!(until, clock.now() + Duration::seconds(30));
        assert!(!h.is_eligible(clock.now()));
        assert!(h.is_eligible(clock.now() + Duration::seconds(31)));
    }

    #[test]
    fn auth_errors_ban() {
        let (reg, clock) = registry();
        reg.register(&account("alpha")).unwrap();
        reg.mark_failure("alpha", &GatewayError::AuthKeyInvalid, None)
            .unwrap();

        let h = reg.health("alpha").unwrap().unwrap();
        assert!(h.is_banned);
        assert!(!h.is_eligible(clock.now() + Duration::days(365)));
        assert_eq!(h.last_error.as_deref(), Some("AUTH_KEY_INVALID"));
    }

    #[test]
    fn channels_too_much_cools_for_a_day() {
        let (reg, clock) = registry();
        reg.register(&account("alpha")).unwrap();
        reg.mark_failure("alpha", &GatewayError::ChannelsTooMuch, None)
            .unwrap();

        let h = reg.health("alpha").unwrap().unwrap();
        assert!(!h.is_banned);
        assert_eq!(h.cooldown_until.unwrap(), clock.now() + Duration::hours(24));
    }

    #[test]
    fn explicit_cooldown_overrides_derived() {
        let (reg, clock) = registry();
        reg.register(&account("alpha")).unwrap();
        reg.mark_failure("alpha", &GatewayError::FloodWait { seconds: 30 }, Some(1.0))
            .unwrap();

        let h = reg.health("alpha").unwrap().unwrap();
        assert_eq!(h.cooldown_until.unwrap(), clock.now() + Duration::hours(1));
    }

    #[test]
    fn success_counter_increments() {
        let (reg, _) = registry();
        reg.register(&account("alpha")).unwrap();
        reg.mark_success("alpha").unwrap();
        reg.mark_success("alpha").unwrap();
        assert_eq!(reg.health("alpha").unwrap().unwrap().success_count, 2);
    }
}
