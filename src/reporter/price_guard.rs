//! Submission guard
//!
//! Blocks a price whose relative change from the last submitted price for the
//! same query exceeds a threshold, unless that last price has expired.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::time::{to_chrono, TimeProvider};
use crate::types::{normalize_query_data, query_id_from_data};

#[derive(Debug, Clone, PartialEq)]
pub enum GuardDecision {
    Allow,
    Block(String),
}

impl GuardDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GuardDecision::Allow)
    }
}

#[derive(Debug, Clone, Copy)]
struct LastPrice {
    price: f64,
    updated_at: DateTime<Utc>,
}

/// Guard parameters
#[derive(Debug, Clone)]
pub struct PriceGuardOptions {
    pub enabled: bool,
    /// Maximum relative change, e.g. `0.5` for 50%
    pub threshold: f64,
    /// Age after which the last price no longer constrains. Zero never expires.
    pub max_age: std::time::Duration,
    /// Also move the baseline when a price is blocked
    pub update_on_block: bool,
    /// Per query id (hex) threshold overrides
    pub query_thresholds: HashMap<String, f64>,
}

impl Default for PriceGuardOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.5,
            max_age: std::time::Duration::from_secs(30 * 60),
            update_on_block: false,
            query_thresholds: HashMap::new(),
        }
    }
}

pub struct PriceGuard {
    enabled: bool,
    threshold: f64,
    max_age: Duration,
    update_on_block: bool,
    query_thresholds: RwLock<HashMap<String, f64>>,
    last_prices: RwLock<HashMap<String, LastPrice>>,
    clock: Arc<dyn TimeProvider>,
}

/// Lowercase hex of the query id for `query_data`
pub fn query_id_hex(query_data: &[u8]) -> String {
    hex::encode(query_id_from_data(query_data))
}

impl PriceGuard {
    pub fn new(options: PriceGuardOptions, clock: Arc<dyn TimeProvider>) -> Self {
        let query_thresholds = options
            .query_thresholds
            .into_iter()
            .map(|(id, threshold)| (normalize_query_data(&id), threshold))
            .collect();
        Self {
            enabled: options.enabled,
            threshold: options.threshold,
            max_age: to_chrono(options.max_age),
            update_on_block: options.update_on_block,
            query_thresholds: RwLock::new(query_thresholds),
            last_prices: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn update_on_block(&self) -> bool {
        self.update_on_block
    }

    /// Install a threshold override for one query id
    pub fn set_query_threshold(&self, query_id_hex: &str, threshold: f64) {
        self.query_thresholds
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(normalize_query_data(query_id_hex), threshold);
    }

    fn threshold_for(&self, query_id: &str) -> f64 {
        self.query_thresholds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(query_id)
            .copied()
            .unwrap_or(self.threshold)
    }

    pub fn last_price(&self, query_data: &[u8]) -> Option<f64> {
        self.last_prices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&query_id_hex(query_data))
            .map(|last| last.price)
    }

    /// Decide whether `candidate` may be submitted. Never mutates state.
    pub fn should_submit(&self, query_data: &[u8], candidate: f64) -> GuardDecision {
        if !self.enabled {
            return GuardDecision::Allow;
        }

        let query_id = query_id_hex(query_data);
        let last = self
            .last_prices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&query_id)
            .copied();
        let threshold = self.threshold_for(&query_id);

        let Some(last) = last else {
            info!(query_id = %query_id, price = candidate, "First submission for query, allowing");
            return GuardDecision::Allow;
        };

        if self.max_age > Duration::zero() {
            let elapsed = self.clock.now() - last.updated_at;
            if elapsed > self.max_age {
                info!(
                    query_id = %query_id,
                    elapsed_secs = elapsed.num_seconds(),
                    old_price = last.price,
                    new_price = candidate,
                    "Last price expired, treating as new baseline"
                );
                return GuardDecision::Allow;
            }
        }

        if last.price == 0.0 {
            warn!(query_id = %query_id, new_price = candidate, "Last price is zero, allowing submission");
            return GuardDecision::Allow;
        }

        let change = (candidate - last.price).abs() / last.price;
        if change > threshold {
            let reason = format!(
                "price change {:.2}% exceeds threshold {:.2}% (last: {:.6}, new: {:.6})",
                change * 100.0,
                threshold * 100.0,
                last.price,
                candidate
            );
            warn!(query_id = %query_id, reason = %reason, "Blocked submission due to price change");
            return GuardDecision::Block(reason);
        }

        debug!(
            query_id = %query_id,
            change_pct = change * 100.0,
            threshold_pct = threshold * 100.0,
            "Price change within threshold"
        );
        GuardDecision::Allow
    }

    /// Record `price` as the baseline for `query_data`. No-op when disabled.
    pub fn update_last_price(&self, query_data: &[u8], price: f64) {
        if !self.enabled {
            return;
        }
        let query_id = query_id_hex(query_data);
        self.last_prices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                query_id.clone(),
                LastPrice {
                    price,
                    updated_at: self.clock.now(),
                },
            );
        debug!(query_id = %query_id, price, "Updated last known price");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use chrono::TimeZone;

    const BTC: &[u8] = b"btc-usd-spot";
    const ETH: &[u8] = b"eth-usd-spot";

    fn make_guard(options: PriceGuardOptions) -> (PriceGuard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        (PriceGuard::new(options, clock.clone()), clock)
    }

    #[test]
    fn first_submission_is_allowed() {
        let (guard, _) = make_guard(PriceGuardOptions::default());
        assert_eq!(guard.should_submit(BTC, 1_000_000.0), GuardDecision::Allow);
    }

    #[test]
    fn threshold_boundary_is_inclusive() {
        let (guard, _) = make_guard(PriceGuardOptions::default());
        guard.update_last_price(BTC, 1000.0);

        assert!(guard.should_submit(BTC, 1500.0).is_allowed());
        assert!(guard.should_submit(BTC, 500.0).is_allowed());
        assert!(!guard.should_submit(BTC, 1501.0).is_allowed());
        assert!(!guard.should_submit(BTC, 499.0).is_allowed());
    }

    #[test]
    fn should_submit_does_not_move_the_baseline() {
        let (guard, _) = make_guard(PriceGuardOptions::default());
        guard.update_last_price(BTC, 1000.0);
        guard.should_submit(BTC, 1400.0);
        assert_eq!(guard.last_price(BTC), Some(1000.0));
    }

    #[test]
    fn queries_are_isolated() {
        let (guard, _) = make_guard(PriceGuardOptions::default());
        guard.update_last_price(BTC, 50_000.0);
        guard.update_last_price(ETH, 3_000.0);

        assert!(guard.should_submit(ETH, 3_100.0).is_allowed());
        assert!(!guard.should_submit(ETH, 50_000.0).is_allowed());
        assert!(guard.should_submit(BTC, 50_000.0).is_allowed());
    }

    #[test]
    fn expired_baseline_allows_any_change() {
        let (guard, clock) = make_guard(PriceGuardOptions {
            max_age: std::time::Duration::from_secs(60),
            ..PriceGuardOptions::default()
        });
        guard.update_last_price(BTC, 1000.0);
        assert!(!guard.should_submit(BTC, 5000.0).is_allowed());

        clock.advance(Duration::seconds(61));
        assert!(guard.should_submit(BTC, 5000.0).is_allowed());
    }

    #[test]
    fn zero_max_age_never_expires() {
        let (guard, clock) = make_guard(PriceGuardOptions {
            max_age: std::time::Duration::ZERO,
            ..PriceGuardOptions::default()
        });
        guard.update_last_price(BTC, 1000.0);
        clock.advance(Duration::days(365));
        assert!(!guard.should_submit(BTC, 5000.0).is_allowed());
    }

    #[test]
    fn zero_baseline_allows() {
        let (guard, _) = make_guard(PriceGuardOptions::default());
        guard.update_last_price(BTC, 0.0);
        assert!(guard.should_submit(BTC, 123.0).is_allowed());
    }

    #[test]
    fn disabled_guard_allows_and_records_nothing() {
        let (guard, _) = make_guard(PriceGuardOptions {
            enabled: false,
            ..PriceGuardOptions::default()
        });
        guard.update_last_price(BTC, 1000.0);
        assert_eq!(guard.last_price(BTC), None);
        assert!(guard.should_submit(BTC, 1_000_000.0).is_allowed());
    }

    #[test]
    fn per_query_threshold_overrides_global() {
        let (guard, _) = make_guard(PriceGuardOptions::default());
        guard.set_query_threshold(&format!("0x{}", query_id_hex(BTC).to_uppercase()), 0.1);
        guard.update_last_price(BTC, 1000.0);
        guard.update_last_price(ETH, 1000.0);

        assert!(!guard.should_submit(BTC, 1200.0).is_allowed());
        assert!(guard.should_submit(ETH, 1200.0).is_allowed());
    }

    #[test]
    fn volatile_sequence_tracks_submitted_prices() {
        let (guard, _) = make_guard(PriceGuardOptions::default());
        let mut submitted = Vec::new();
        for candidate in [100.0, 140.0, 300.0, 200.0, 90.0, 110.0] {
            if guard.should_submit(BTC, candidate).is_allowed() {
                guard.update_last_price(BTC, candidate);
                submitted.push(candidate);
            }
        }
        // 300 is +114% from 140, 90 is -55% from 200
        assert_eq!(submitted, vec![100.0, 140.0, 200.0, 110.0]);
    }

    #[test]
    fn block_reason_names_both_prices() {
        let (guard, _) = make_guard(PriceGuardOptions::default());
        guard.update_last_price(BTC, 1000.0);
        match guard.should_submit(BTC, 2000.0) {
            GuardDecision::Block(reason) => {
                assert!(reason.contains("100.00%"));
                assert!(reason.contains("1000.000000"));
            }
            GuardDecision::Allow => panic!("expected block"),
        }
    }
}
