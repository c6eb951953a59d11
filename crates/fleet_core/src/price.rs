//! Energy price signals.
//!
//! The fleet never fetches prices itself. It only asks a [`PriceGate`] whether
//! now is a good time to charge, and when the next good time is.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PriceError {
    #[error("Price data unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("Price gate did not answer in time")]
    Timeout,
}

#[async_trait]
pub trait PriceGate: Send + Sync {
    async fn is_price_currently_favorable(&self) -> Result<bool, PriceError>;

    /// `None` when no favorable instant is known.
    async fn next_favorable_instant(&self) -> Result<Option<DateTime<Utc>>, PriceError>;
}

/// Gate used when no price information is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysFavorable;

#[async_trait]
impl PriceGate for AlwaysFavorable {
    async fn is_price_currently_favorable(&self) -> Result<bool, PriceError> {
        Ok(true)
    }

    async fn next_favorable_instant(&self) -> Result<Option<DateTime<Utc>>, PriceError> {
        Ok(None)
    }
}

/// What a tick makes of the price gate's answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriceVerdict {
    Favorable,
    WaitUntil(DateTime<Utc>),
    /// The gate failed; cheap-hours stations keep their previous decision.
    Unavailable,
}

impl PriceVerdict {
    pub fn from_answers(
        favorable: bool,
        next_favorable: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        match (favorable, next_favorable) {
            (true, _) => PriceVerdict::Favorable,
            // An instant already passed can never arrive
            (false, Some(instant)) if instant <= now => PriceVerdict::Favorable,
            (false, Some(instant)) => PriceVerdict::WaitUntil(instant),
            // Nothing better is known, so a station is not starved forever
            (false, None) => PriceVerdict::Favorable,
        }
    }
}

/// Price of energy in one time slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Price {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub price: f64,
}

impl Price {
    pub fn is_valid_for(&self, instant: DateTime<Utc>) -> bool {
        self.from <= instant && instant < self.to
    }
}

/// Return when charging may start, or `None` when it may start now.
///
/// Of the slots not yet over, the `skip_percent_expensive_hours` most expensive
/// ones are avoided. If none remain, the end of the known prices is returned,
/// unless that is already over.
pub fn must_wait_until(
    prices: &[Price],
    now: DateTime<Utc>,
    skip_percent_expensive_hours: u8,
) -> Option<DateTime<Utc>> {
    let skip = u32::from(skip_percent_expensive_hours.min(100));

    let mut allowed: Vec<&Price> = prices.iter().filter(|p| p.to > now).collect();
    allowed.sort_by(|a, b| a.price.total_cmp(&b.price));
    let keep = ((100 - skip) as usize * allowed.len()) / 100;
    allowed.truncate(keep);
    allowed.sort_by_key(|p| p.from);

    match allowed.first() {
        None => {
            let end_of_known_prices = prices
                .iter()
                .max_by_key(|p| p.from)
                .map(|p| p.to)
                .filter(|end| *end > now);
            tracing::info!(
                "No cheap enough slot available, waiting until end of known prices {:?}",
                end_of_known_prices
            );
            end_of_known_prices
        }
        Some(next) if next.is_valid_for(now) => None,
        Some(next) => Some(next.from),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn midnight() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    /// Hourly prices starting at midnight
    fn hourly(prices: &[f64]) -> Vec<Price> {
        prices
            .iter()
            .enumerate()
            .map(|(hour, price)| Price {
                from: midnight() + Duration::hours(hour as i64),
                to: midnight() + Duration::hours(hour as i64 + 1),
                price: *price,
            })
            .collect()
    }

    #[test]
    fn test_no_skipping_means_now() {
        let prices = hourly(&[3.0, 1.0, 2.0, 4.0]);
        let now = midnight() + Duration::minutes(10);
        assert_eq!(must_wait_until(&prices, now, 0), None);
    }

    #[test]
    fn test_waits_for_next_cheap_hour() {
        let prices = hourly(&[3.0, 1.0, 2.0, 4.0]);
        let now = midnight() + Duration::minutes(10);
        // Keep the cheapest half: hours 1 and 2
        assert_eq!(
            must_wait_until(&prices, now, 50),
            Some(midnight() + Duration::hours(1))
        );
        // Inside hour 1 it is fine to charge
        let now = midnight() + Duration::minutes(70);
        assert_eq!(must_wait_until(&prices, now, 50), None);
    }

    #[test]
    fn test_past_slots_are_ignored() {
        let prices = hourly(&[1.0, 5.0, 4.0, 3.0]);
        let now = midnight() + Duration::minutes(90);
        // Future slots are 5.0, 4.0, 3.0; keeping one leaves hour 3
        assert_eq!(
            must_wait_until(&prices, now, 66),
            Some(midnight() + Duration::hours(3))
        );
    }

    #[test]
    fn test_nothing_kept_waits_for_end_of_prices() {
        let prices = hourly(&[3.0, 1.0]);
        let now = midnight() + Duration::minutes(10);
        assert_eq!(
            must_wait_until(&prices, now, 100),
            Some(midnight() + Duration::hours(2))
        );
        assert_eq!(must_wait_until(&[], now, 50), None);
    }

    #[test]
    fn test_stale_prices_mean_now() {
        let prices = hourly(&[3.0, 1.0]);
        let now = midnight() + Duration::hours(5);
        assert_eq!(must_wait_until(&prices, now, 50), None);
        assert_eq!(must_wait_until(&prices, now, 100), None);
    }

    #[test]
    fn test_verdict_from_answers() {
        let now = midnight();
        let later = midnight() + Duration::hours(4);
        assert_eq!(
            PriceVerdict::from_answers(true, Some(later), now),
            PriceVerdict::Favorable
        );
        assert_eq!(
            PriceVerdict::from_answers(false, Some(later), now),
            PriceVerdict::WaitUntil(later)
        );
        assert_eq!(
            PriceVerdict::from_answers(false, None, now),
            PriceVerdict::Favorable
        );
    }

    #[test]
    fn test_verdict_for_past_instant_is_favorable() {
        let earlier = midnight() - Duration::hours(1);
        assert_eq!(
            PriceVerdict::from_answers(false, Some(earlier), midnight()),
            PriceVerdict::Favorable
        );
        assert_eq!(
            PriceVerdict::from_answers(false, Some(midnight()), midnight()),
            PriceVerdict::Favorable
        );
    }
}
