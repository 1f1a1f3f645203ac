use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use spectra_core::clock::nano_jitter;
use spectra_core::config::RotationMode;
use spectra_core::Clock;
use spectra_store::AccountHealth;
use tracing::debug;

use crate::error::{AccountError, Result};
use crate::registry::AccountRegistry;

/// Hours-since-last-use assumed for accounts that were never used, so the
/// smart policy prefers them over anything recently active.
const NEVER_USED_HOURS: f64 = 24.0 * 365.0;

/// Selects the next account according to the configured policy, skipping
/// banned and cooling-down accounts. Selection persists the usage bump
/// before the account is handed out.
pub struct AccountRotator {
    registry: Arc<AccountRegistry>,
    mode: RotationMode,
    clock: Arc<dyn Clock>,
    cursor: AtomicUsize,
}

impl AccountRotator {
    pub fn new(registry: Arc<AccountRegistry>, mode: RotationMode, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            mode,
            clock,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn mode(&self) -> RotationMode {
        self.mode
    }

    /// Pick the next account. Fails with `NoAccountAvailable` when every
    /// account is banned or cooling down.
    pub fn next(&self) -> Result<AccountHealth> {
        let accounts = self.registry.all()?;
        let now = self.clock.now();

        let selected = match self.mode {
            RotationMode::Sequential => self.pick_sequential(&accounts, now),
            RotationMode::Random => pick_random(&accounts, now),
            RotationMode::LeastUsed => pick_least_used(&accounts, now),
            RotationMode::Smart => pick_smart(&accounts, now),
        }
        .ok_or(AccountError::NoAccountAvailable)?;

        self.registry.record_selection(&selected.session_handle)?;
        debug!(account = %selected.session_handle, mode = ?self.mode, "account selected");

        // Return the post-selection view so callers see current counters.
        self.registry
            .health(&selected.session_handle)?
            .ok_or_else(|| AccountError::UnknownAccount(selected.session_handle.clone()))
    }

    /// Cycle in registration order, skipping ineligible accounts.
    fn pick_sequential(&self, accounts: &[AccountHealth], now: chrono::DateTime<chrono::Utc>) -> Option<AccountHealth> {
        if accounts.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        (0..accounts.len())
            .map(|i| &accounts[(start + i) % accounts.len()])
            .find(|a| a.is_eligible(now))
            .cloned()
    }
}

fn eligible(accounts: &[AccountHealth], now: chrono::DateTime<chrono::Utc>) -> Vec<&AccountHealth> {
    accounts.iter().filter(|a| a.is_eligible(now)).collect()
}

fn pick_random(accounts: &[AccountHealth], now: chrono::DateTime<chrono::Utc>) -> Option<AccountHealth> {
    let pool = eligible(accounts, now);
    if pool.is_empty() {
        return None;
    }
    Some(pool[nano_jitter(pool.len() as u64) as usize].clone())
}

/// Eligible account with the fewest uses; ties broken by session handle.
fn pick_least_used(accounts: &[AccountHealth], now: chrono::DateTime<chrono::Utc>) -> Option<AccountHealth> {
    eligible(accounts, now)
        .into_iter()
        .min_by(|a, b| {
            a.usage_count
                .cmp(&b.usage_count)
                .then_with(|| a.session_handle.cmp(&b.session_handle))
        })
        .cloned()
}

/// Weighted blend of idle time and usage: `0.7·hours_idle + 0.3/(usage+1)`.
/// Ties broken by session handle.
fn pick_smart(accounts: &[AccountHealth], now: chrono::DateTime<chrono::Utc>) -> Option<AccountHealth> {
    let pool = eligible(accounts, now);

    pool.into_iter()
        .map(|a| {
            let hours_idle = match a.last_used {
                Some(last) => (now - last).num_seconds().max(0) as f64 / 3600.0,
                None => NEVER_USED_HOURS,
            };
            let score = 0.7 * hours_idle + 0.3 / (a.usage_count as f64 + 1.0);
            (score, a)
        })
        .max_by(|(sa, a), (sb, b)| {
            sa.partial_cmp(sb)
                .unwrap_or(std::cmp::Ordering::Equal)
                // Reversed handle order: max_by keeps the later "greater"
                // element, so the lexicographically smaller handle must
                // compare greater on ties.
                .then_with(|| b.session_handle.cmp(&a.session_handle))
        })
        .map(|(_, a)| a.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use spectra_core::config::AccountConfig;
    use spectra_core::ManualClock;
    use spectra_gateway::GatewayError;
    use spectra_store::Store;

    fn setup(mode: RotationMode, handles: &[&str]) -> (AccountRotator, Arc<AccountRegistry>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Arc::new(AccountRegistry::new(store, clock.clone()));
        for h in handles {
            registry
                .register(&AccountConfig {
                    api_id: 1,
                    api_hash: "x".into(),
                    session_handle: (*h).into(),
                    phone: None,
                    password: None,
                })
                .unwrap();
        }
        (
            AccountRotator::new(registry.clone(), mode, clock.clone()),
            registry,
            clock,
        )
    }

    #[test]
    fn sequential_cycles_in_registration_order() {
        let (rot, _, _) = setup(RotationMode::Sequential, &["a", "b", "c"]);
        let picks: Vec<String> = (0..4).map(|_| rot.next().unwrap().session_handle).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn sequential_skips_cooling_account() {
        let (rot, reg, _) = setup(RotationMode::Sequential, &["a", "b"]);
        reg.mark_failure("a", &GatewayError::FloodWait { seconds: 60 }, None)
            .unwrap();

        assert_eq!(rot.next().unwrap().session_handle, "b");
        assert_eq!(rot.next().unwrap().session_handle, "b");
    }

    #[test]
    fn cooldown_expiry_restores_eligibility() {
        let (rot, reg, clock) = setup(RotationMode::Sequential, &["a"]);
        reg.mark_failure("a", &GatewayError::FloodWait { seconds: 30 }, None)
            .unwrap();
        assert!(matches!(rot.next(), Err(AccountError::NoAccountAvailable)));

        clock.advance(Duration::seconds(31));
        assert_eq!(rot.next().unwrap().session_handle, "a");
    }

    #[test]
    fn least_used_prefers_low_usage_then_handle() {
        let (rot, reg, _) = setup(RotationMode::LeastUsed, &["b", "a", "c"]);
        reg.record_selection("b").unwrap();
        reg.record_selection("c").unwrap();

        // "a" has usage 0.
        assert_eq!(rot.next().unwrap().session_handle, "a");
        // Now all tie at 1; lexicographic handle wins.
        assert_eq!(rot.next().unwrap().session_handle, "a");
    }

    #[test]
    fn smart_prefers_idle_account() {
        let (rot, reg, clock) = setup(RotationMode::Smart, &["a", "b"]);
        reg.record_selection("a").unwrap();
        clock.advance(Duration::hours(2));
        reg.record_selection("b").unwrap();

        // "a" has been idle 2 h, "b" was just used.
        assert_eq!(rot.next().unwrap().session_handle, "a");
    }

    #[test]
    fn smart_tie_breaks_lexicographically() {
        let (rot, _, _) = setup(RotationMode::Smart, &["beta", "alpha"]);
        // Both never used: identical scores.
        assert_eq!(rot.next().unwrap().session_handle, "alpha");
    }

    #[test]
    fn banned_accounts_never_selected() {
        let (rot, reg, _) = setup(RotationMode::Random, &["a", "b"]);
        reg.mark_failure("a", &GatewayError::AuthDeactivated, None)
            .unwrap();
        for _ in 0..20 {
            assert_eq!(rot.next().unwrap().session_handle, "b");
        }
    }

    #[test]
    fn no_eligible_account_errors() {
        let (rot, reg, _) = setup(RotationMode::Random, &["a"]);
        reg.mark_failure("a", &GatewayError::AuthDeactivated, None)
            .unwrap();
        assert!(matches!(rot.next(), Err(AccountError::NoAccountAvailable)));
    }

    #[test]
    fn selection_persists_usage() {
        let (rot, reg, _) = setup(RotationMode::Sequential, &["a"]);
        let picked = rot.next().unwrap();
        assert_eq!(picked.usage_count, 1);
        assert!(picked.last_used.is_some());
        assert_eq!(reg.health("a").unwrap().unwrap().usage_count, 1);
    }
}
