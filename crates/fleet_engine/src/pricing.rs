//! Price gate answering from a cached list of hourly prices.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::price::{Price, PriceError, PriceGate, must_wait_until};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// Prices are fetched at most this often.
pub const RELOAD_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn prices(&self) -> Result<Vec<Price>, PriceError>;
}

/// Reads a JSON array of `{ "from", "to", "price" }` slots.
#[derive(Debug, Clone)]
pub struct JsonFilePriceSource {
    path: PathBuf,
}

impl JsonFilePriceSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFilePriceSource { path: path.into() }
    }
}

#[async_trait]
impl PriceSource for JsonFilePriceSource {
    async fn prices(&self) -> Result<Vec<Price>, PriceError> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| PriceError::Unavailable {
                reason: format!("Could not read {}: {}", self.path.display(), e),
            })?;
        serde_json::from_str(&contents).map_err(|e| PriceError::Unavailable {
            reason: format!("Could not parse {}: {}", self.path.display(), e),
        })
    }
}

#[derive(Default)]
struct PriceCache {
    prices: Vec<Price>,
    last_reload: Option<Instant>,
}

/// Favorable during the cheapest hours of the known prices.
///
/// `skip_percent_expensive_hours` of the remaining slots, the most expensive
/// ones, are avoided. A failed reload keeps the previous prices.
pub struct CheapHoursPriceGate<S> {
    source: S,
    skip_percent_expensive_hours: u8,
    cache: Mutex<PriceCache>,
}

impl<S: PriceSource> CheapHoursPriceGate<S> {
    pub fn new(source: S, skip_percent_expensive_hours: u8) -> Self {
        CheapHoursPriceGate {
            source,
            skip_percent_expensive_hours: skip_percent_expensive_hours.min(100),
            cache: Mutex::new(PriceCache::default()),
        }
    }

    async fn wait_until(&self) -> Option<DateTime<Utc>> {
        let mut cache = self.cache.lock().await;
        let due = cache
            .last_reload
            .is_none_or(|last| last.elapsed() >= RELOAD_INTERVAL);
        if due {
            info!("Fetching energy prices");
            cache.last_reload = Some(Instant::now());
            match self.source.prices().await {
                Ok(prices) if !prices.is_empty() => {
                    info!("Fetched {} energy prices", prices.len());
                    cache.prices = prices;
                }
                Ok(_) => warn!("Price source returned no prices, keeping {}", cache.prices.len()),
                Err(e) => warn!("Could not fetch energy prices: {}", e),
            }
        }
        must_wait_until(&cache.prices, Utc::now(), self.skip_percent_expensive_hours)
    }
}

#[async_trait]
impl<S: PriceSource> PriceGate for CheapHoursPriceGate<S> {
    async fn is_price_currently_favorable(&self) -> Result<bool, PriceError> {
        Ok(self.wait_until().await.is_none())
    }

    async fn next_favorable_instant(&self) -> Result<Option<DateTime<Utc>>, PriceError> {
        Ok(self.wait_until().await)
    }
}
