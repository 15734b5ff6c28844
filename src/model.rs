//! Typed snapshots, modes, order classification and intents.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// Exposure
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Bucket {
    #[serde(rename = "LT", alias = "lt")]
    Lt,
    #[serde(rename = "MM", alias = "mm")]
    Mm,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Lt => "LT",
            Bucket::Mm => "MM",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed: >0 long, <0 short.
    #[serde(alias = "qty")]
    pub quantity: f64,
    #[serde(default)]
    pub avg_price: f64,
    #[serde(default)]
    pub notional: f64,
    pub bucket: Bucket,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.quantity == 0.0
    }

    pub fn is_long(&self) -> bool {
        self.quantity > 0.0
    }

    pub fn abs_notional(&self) -> f64 {
        self.notional.abs()
    }

    /// Per-share price: average price, else notional over quantity.
    pub fn price(&self) -> f64 {
        if self.avg_price > 0.0 {
            self.avg_price
        } else if self.quantity != 0.0 {
            (self.notional / self.quantity).abs()
        } else {
            0.0
        }
    }

    pub fn context(&self) -> PositionContext {
        PositionContext {
            quantity: self.quantity,
            avg_price: self.avg_price,
            notional: self.notional,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketExposure {
    #[serde(default)]
    pub current_pct: f64,
    #[serde(default)]
    pub potential_pct: f64,
    #[serde(default)]
    pub current: f64,
    #[serde(default)]
    pub potential: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureSnapshot {
    pub gross_exposure_pct: f64,
    pub equity: f64,
    #[serde(default)]
    pub open_orders_potential: f64,
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default)]
    pub buckets: BTreeMap<String, BucketExposure>,
}

impl ExposureSnapshot {
    /// Missing bucket reads as zero exposure.
    pub fn bucket(&self, bucket: Bucket) -> BucketExposure {
        self.buckets.get(bucket.as_str()).copied().unwrap_or_default()
    }

    pub fn has_valid_equity(&self) -> bool {
        self.equity.is_finite() && self.equity > 0.0
    }

    /// Gross plus resting order risk, as percent of equity.
    pub fn potential_exposure_pct(&self) -> f64 {
        if !self.has_valid_equity() {
            return self.gross_exposure_pct;
        }
        self.gross_exposure_pct + (self.open_orders_potential / self.equity) * 100.0
    }

    /// Largest position by notional among those holding at least one whole share.
    pub fn largest_tradable_position(&self) -> Option<&Position> {
        self.positions
            .iter()
            .filter(|p| p.quantity.abs() >= 1.0)
            .max_by(|a, b| a.abs_notional().total_cmp(&b.abs_notional()))
    }

    /// LT long and LT short notional as percent of equity.
    pub fn lt_side_pcts(&self) -> (f64, f64) {
        if !self.has_valid_equity() {
            return (0.0, 0.0);
        }
        let mut long = 0.0;
        let mut short = 0.0;
        for p in self.positions.iter().filter(|p| p.bucket == Bucket::Lt) {
            if p.quantity > 0.0 {
                long += p.abs_notional();
            } else if p.quantity < 0.0 {
                short += p.abs_notional();
            }
        }
        (long / self.equity * 100.0, short / self.equity * 100.0)
    }
}

// =============================================================================
// Session
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Regime {
    Pre,
    Regular,
    Late,
    Close,
    Closed,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Pre => "PRE",
            Regime::Regular => "REGULAR",
            Regime::Late => "LATE",
            Regime::Close => "CLOSE",
            Regime::Closed => "CLOSED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PRE" => Some(Regime::Pre),
            "REGULAR" => Some(Regime::Regular),
            "LATE" => Some(Regime::Late),
            "CLOSE" => Some(Regime::Close),
            "CLOSED" => Some(Regime::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub regime: Regime,
    #[serde(default)]
    pub minutes_to_close: Option<f64>,
}

// =============================================================================
// Operating mode
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingMode {
    Normal,
    ThrottleNewOrders,
    SoftDerisk,
    HardDerisk,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Normal => "NORMAL",
            OperatingMode::ThrottleNewOrders => "THROTTLE_NEW_ORDERS",
            OperatingMode::SoftDerisk => "SOFT_DERISK",
            OperatingMode::HardDerisk => "HARD_DERISK",
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mode string handed to the arbiter; HARD_DERISK past the cap reads CAP_RECOVERY.
pub fn mode_label(mode: OperatingMode, cap_breach: bool) -> &'static str {
    if mode == OperatingMode::HardDerisk && cap_breach {
        "CAP_RECOVERY"
    } else {
        mode.as_str()
    }
}

// =============================================================================
// Order classification
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
        }
    }

    /// The action that shrinks a position of the given sign.
    pub fn reducing(quantity: f64) -> Self {
        if quantity < 0.0 {
            Action::Buy
        } else {
            Action::Sell
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Effect {
    Increase,
    Decrease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderClassification {
    pub bucket: Bucket,
    pub direction: Direction,
    pub effect: Effect,
    pub is_risk_increasing: bool,
}

impl OrderClassification {
    pub const fn new(bucket: Bucket, direction: Direction, effect: Effect) -> Self {
        Self {
            bucket,
            direction,
            effect,
            is_risk_increasing: matches!(effect, Effect::Increase),
        }
    }

    /// Classify an action against the current signed quantity.
    ///
    /// A flat book opens long on BUY and short on SELL.
    pub fn derive(bucket: Bucket, quantity: f64, action: Action) -> Self {
        let (direction, effect) = match (quantity > 0.0, quantity < 0.0, action) {
            (true, _, Action::Buy) => (Direction::Long, Effect::Increase),
            (true, _, Action::Sell) => (Direction::Long, Effect::Decrease),
            (_, true, Action::Sell) => (Direction::Short, Effect::Increase),
            (_, true, Action::Buy) => (Direction::Short, Effect::Decrease),
            (_, _, Action::Buy) => (Direction::Long, Effect::Increase),
            (_, _, Action::Sell) => (Direction::Short, Effect::Increase),
        };
        Self::new(bucket, direction, effect)
    }

    pub fn for_position(position: &Position, action: Action) -> Self {
        Self::derive(position.bucket, position.quantity, action)
    }
}

impl fmt::Display for OrderClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        };
        let eff = match self.effect {
            Effect::Increase => "INCREASE",
            Effect::Decrease => "DECREASE",
        };
        write!(f, "{}_{}_{}", self.bucket.as_str(), dir, eff)
    }
}

// =============================================================================
// Intents
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentType {
    SoftDerisk,
    HardDerisk,
    CapRecovery,
    LtBandCorrective,
    LtTrim,
}

impl IntentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentType::SoftDerisk => "SOFT_DERISK",
            IntentType::HardDerisk => "HARD_DERISK",
            IntentType::CapRecovery => "CAP_RECOVERY",
            IntentType::LtBandCorrective => "LT_BAND_CORRECTIVE",
            IntentType::LtTrim => "LT_TRIM",
        }
    }

    pub fn default_priority(&self) -> i32 {
        match self {
            IntentType::CapRecovery => priority::CAP_RECOVERY,
            IntentType::HardDerisk => priority::HARD_DERISK,
            IntentType::SoftDerisk => priority::SOFT_DERISK,
            IntentType::LtTrim => priority::LT_TRIM,
            IntentType::LtBandCorrective => priority::LT_BAND_CORRECTIVE,
        }
    }
}

pub mod priority {
    pub const CAP_RECOVERY: i32 = 100;
    pub const HARD_DERISK: i32 = 90;
    pub const SOFT_DERISK: i32 = 50;
    pub const LT_TRIM: i32 = 5;
    pub const LT_BAND_CORRECTIVE: i32 = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionContext {
    pub quantity: f64,
    pub avg_price: f64,
    pub notional: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub intent_type: IntentType,
    pub symbol: String,
    pub action: Action,
    pub quantity: i64,
    pub classification: OrderClassification,
    /// Negative reduces exposure.
    pub risk_delta_notional: f64,
    pub risk_delta_gross_pct: f64,
    pub position_context_at_intent: PositionContext,
    pub priority: i32,
    pub limit_price: Option<f64>,
    pub reason: String,
}

/// Inputs for an intent sized against one position.
#[derive(Debug, Clone)]
pub struct IntentSpec<'a> {
    pub intent_type: IntentType,
    pub position: &'a Position,
    pub action: Action,
    pub quantity: i64,
    pub equity: f64,
    pub priority: i32,
    pub limit_price: Option<f64>,
    pub reason: String,
}

impl Intent {
    /// Classification, risk deltas and audit context all derive from the position.
    pub fn from_position(spec: IntentSpec<'_>) -> Self {
        let classification = OrderClassification::for_position(spec.position, spec.action);
        let magnitude = spec.quantity as f64 * spec.position.price();
        let risk_delta_notional = if classification.is_risk_increasing {
            magnitude
        } else {
            -magnitude
        };
        let risk_delta_gross_pct = if spec.equity > 0.0 {
            risk_delta_notional / spec.equity * 100.0
        } else {
            0.0
        };
        Self {
            intent_type: spec.intent_type,
            symbol: spec.position.symbol.clone(),
            action: spec.action,
            quantity: spec.quantity,
            classification,
            risk_delta_notional,
            risk_delta_gross_pct,
            position_context_at_intent: spec.position.context(),
            priority: spec.priority,
            limit_price: spec.limit_price,
            reason: spec.reason,
        }
    }

    pub fn is_risk_increasing(&self) -> bool {
        self.classification.is_risk_increasing
    }
}

/// One cent through the reference price: BUY pays up, SELL gives down.
pub fn one_cent_through(action: Action, reference: f64) -> f64 {
    let raw = match action {
        Action::Buy => reference + 0.01,
        Action::Sell => reference - 0.01,
    };
    (raw * 100.0).round() / 100.0
}

/// Intent as it appears on the outbound stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedIntent {
    pub intent_id: String,
    pub source_message_id: Option<String>,
    pub mode: String,
    pub emitted_at: String,
    pub intent: Intent,
}

// =============================================================================
// Cap recovery
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapRecoveryEpisode {
    pub episode_id: String,
    pub opened_ts: u64,
    pub opened_gross_pct: f64,
    pub peak_gross_pct: f64,
    pub target_pct: f64,
}
