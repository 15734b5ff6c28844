//! Best-effort market data lookups.
//!
//! Missing quotes are normal: every accessor returns `Option` and callers
//! degrade instead of failing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::logging::{log, obj, v_str, Domain, Level};
use crate::storage::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct L1Quote {
    pub bid: f64,
    pub ask: f64,
    #[serde(default)]
    pub bid_size: f64,
    #[serde(default)]
    pub ask_size: f64,
}

impl L1Quote {
    pub fn is_valid(&self) -> bool {
        self.bid.is_finite() && self.ask.is_finite() && self.bid > 0.0 && self.ask >= self.bid
    }

    pub fn mid(&self) -> Option<f64> {
        if self.is_valid() {
            Some((self.bid + self.ask) / 2.0)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TruthPrice {
    pub price: f64,
}

pub trait MarketData: Send + Sync {
    fn l1(&self, symbol: &str) -> Option<L1Quote>;
    fn truth(&self, symbol: &str) -> Option<TruthPrice>;
    /// Confidence in the truth price, 0..=1.
    fn confidence(&self, symbol: &str) -> Option<f64>;
}

/// Market data keyed by symbol, gathered once per evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketView {
    pub l1: HashMap<String, L1Quote>,
    pub truth: HashMap<String, TruthPrice>,
    pub confidence: HashMap<String, f64>,
}

impl MarketView {
    pub fn collect<'a>(source: &dyn MarketData, symbols: impl IntoIterator<Item = &'a str>) -> Self {
        let mut view = Self::default();
        for symbol in symbols {
            if let Some(q) = source.l1(symbol) {
                view.l1.insert(symbol.to_string(), q);
            }
            if let Some(t) = source.truth(symbol) {
                view.truth.insert(symbol.to_string(), t);
            }
            if let Some(c) = source.confidence(symbol) {
                view.confidence.insert(symbol.to_string(), c);
            }
        }
        view
    }
}

/// Reads `l1:<SYM>`, `truth:<SYM>` and `confidence:<SYM>` from the state store.
pub struct StoreMarketData {
    store: Arc<dyn StateStore>,
}

impl StoreMarketData {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    fn lookup<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.store.get_state(key) {
            Ok(Some(value)) => serde_json::from_value(value).ok(),
            Ok(None) => None,
            Err(e) => {
                log(
                    Level::Debug,
                    Domain::State,
                    "market_data_lookup_failed",
                    obj(&[("key", v_str(key)), ("error", v_str(&e.to_string()))]),
                );
                None
            }
        }
    }
}

impl MarketData for StoreMarketData {
    fn l1(&self, symbol: &str) -> Option<L1Quote> {
        self.lookup(&format!("l1:{}", symbol))
    }

    fn truth(&self, symbol: &str) -> Option<TruthPrice> {
        self.lookup(&format!("truth:{}", symbol))
    }

    fn confidence(&self, symbol: &str) -> Option<f64> {
        self.lookup::<f64>(&format!("confidence:{}", symbol))
            .filter(|c| c.is_finite())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticMarketData {
    view: MarketView,
}

impl StaticMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_l1(mut self, symbol: &str, bid: f64, ask: f64) -> Self {
        self.view.l1.insert(
            symbol.to_string(),
            L1Quote {
                bid,
                ask,
                bid_size: 0.0,
                ask_size: 0.0,
            },
        );
        self
    }

    pub fn with_truth(mut self, symbol: &str, price: f64) -> Self {
        self.view.truth.insert(symbol.to_string(), TruthPrice { price });
        self
    }

    pub fn with_confidence(mut self, symbol: &str, confidence: f64) -> Self {
        self.view.confidence.insert(symbol.to_string(), confidence);
        self
    }
}

impl MarketData for StaticMarketData {
    fn l1(&self, symbol: &str) -> Option<L1Quote> {
        self.view.l1.get(symbol).copied()
    }

    fn truth(&self, symbol: &str) -> Option<TruthPrice> {
        self.view.truth.get(symbol).copied()
    }

    fn confidence(&self, symbol: &str) -> Option<f64> {
        self.view.confidence.get(symbol).copied()
    }
}
