#[derive(Debug, Clone)]
pub struct Config {
    pub event_db_path: String,
    pub state_db_path: String,
    pub journal_path: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub exposure_topic: String,
    pub session_topic: String,
    pub intents_topic: String,
    pub control_topic: String,
    pub read_count: usize,
    pub read_block_ms: u64,
    pub hard_cap_pct: f64,
    pub soft_limit_pct: f64,
    pub throttle_pct: f64,
    pub hard_target_pct: f64,
    pub cap_recovery_target_pct: f64,
    pub lt_potential_limit_pct: f64,
    pub mm_potential_limit_pct: f64,
    pub late_gross_limit_pct: f64,
    pub hard_chunk_fraction: f64,
    pub soft_chunk_fraction: f64,
    pub close_window_minutes: f64,
    pub band_min_short_share: f64,
    pub band_max_short_share: f64,
    pub band_min_long_pct: f64,
    pub band_max_long_pct: f64,
    pub band_gentleness: f64,
    pub band_max_step_fraction: f64,
    pub band_use_limit_orders: bool,
    pub trim_stretch_pct: f64,
    pub trim_fraction: f64,
    pub exit_max_position_fraction: f64,
    pub exit_min_confidence: f64,
    pub circuit_threshold: u32,
    pub idle_backoff_ms: u64,
    pub startup_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            event_db_path: "./events.sqlite".to_string(),
            state_db_path: "./state.sqlite".to_string(),
            journal_path: "./risk.journal".to_string(),
            consumer_group: "decision_engine".to_string(),
            consumer_name: "engine-1".to_string(),
            exposure_topic: "exposure".to_string(),
            session_topic: "session".to_string(),
            intents_topic: "intents".to_string(),
            control_topic: "execution_control".to_string(),
            read_count: 10,
            read_block_ms: 1000,
            hard_cap_pct: 130.0,
            soft_limit_pct: 120.0,
            throttle_pct: 110.0,
            hard_target_pct: 100.0,
            cap_recovery_target_pct: 123.0,
            lt_potential_limit_pct: 90.0,
            mm_potential_limit_pct: 60.0,
            late_gross_limit_pct: 105.0,
            hard_chunk_fraction: 0.10,
            soft_chunk_fraction: 0.05,
            close_window_minutes: 2.0,
            band_min_short_share: 0.20,
            band_max_short_share: 0.50,
            band_min_long_pct: 10.0,
            band_max_long_pct: 80.0,
            band_gentleness: 0.25,
            band_max_step_fraction: 0.10,
            band_use_limit_orders: true,
            trim_stretch_pct: 3.0,
            trim_fraction: 0.10,
            exit_max_position_fraction: 0.50,
            exit_min_confidence: 0.0,
            circuit_threshold: 5,
            idle_backoff_ms: 2000,
            startup_retries: 5,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            event_db_path: std::env::var("EVENT_DB_PATH").unwrap_or(d.event_db_path),
            state_db_path: std::env::var("STATE_DB_PATH").unwrap_or(d.state_db_path),
            journal_path: std::env::var("JOURNAL_PATH").unwrap_or(d.journal_path),
            consumer_group: std::env::var("CONSUMER_GROUP").unwrap_or(d.consumer_group),
            consumer_name: std::env::var("CONSUMER_NAME").unwrap_or(d.consumer_name),
            exposure_topic: std::env::var("EXPOSURE_TOPIC").unwrap_or(d.exposure_topic),
            session_topic: std::env::var("SESSION_TOPIC").unwrap_or(d.session_topic),
            intents_topic: std::env::var("INTENTS_TOPIC").unwrap_or(d.intents_topic),
            control_topic: std::env::var("CONTROL_TOPIC").unwrap_or(d.control_topic),
            read_count: std::env::var("READ_COUNT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.read_count),
            read_block_ms: std::env::var("READ_BLOCK_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.read_block_ms),
            hard_cap_pct: std::env::var("HARD_CAP_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.hard_cap_pct),
            soft_limit_pct: std::env::var("SOFT_LIMIT_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.soft_limit_pct),
            throttle_pct: std::env::var("THROTTLE_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.throttle_pct),
            hard_target_pct: std::env::var("HARD_TARGET_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.hard_target_pct),
            cap_recovery_target_pct: std::env::var("CAP_RECOVERY_TARGET_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.cap_recovery_target_pct),
            lt_potential_limit_pct: std::env::var("LT_POTENTIAL_LIMIT_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.lt_potential_limit_pct),
            mm_potential_limit_pct: std::env::var("MM_POTENTIAL_LIMIT_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.mm_potential_limit_pct),
            late_gross_limit_pct: std::env::var("LATE_GROSS_LIMIT_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.late_gross_limit_pct),
            hard_chunk_fraction: std::env::var("HARD_CHUNK_FRACTION").ok().and_then(|v| v.parse().ok()).unwrap_or(d.hard_chunk_fraction),
            soft_chunk_fraction: std::env::var("SOFT_CHUNK_FRACTION").ok().and_then(|v| v.parse().ok()).unwrap_or(d.soft_chunk_fraction),
            close_window_minutes: std::env::var("CLOSE_WINDOW_MINUTES").ok().and_then(|v| v.parse().ok()).unwrap_or(d.close_window_minutes),
            band_min_short_share: std::env::var("BAND_MIN_SHORT_SHARE").ok().and_then(|v| v.parse().ok()).unwrap_or(d.band_min_short_share),
            band_max_short_share: std::env::var("BAND_MAX_SHORT_SHARE").ok().and_then(|v| v.parse().ok()).unwrap_or(d.band_max_short_share),
            band_min_long_pct: std::env::var("BAND_MIN_LONG_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.band_min_long_pct),
            band_max_long_pct: std::env::var("BAND_MAX_LONG_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.band_max_long_pct),
            band_gentleness: std::env::var("BAND_GENTLENESS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.band_gentleness),
            band_max_step_fraction: std::env::var("BAND_MAX_STEP_FRACTION").ok().and_then(|v| v.parse().ok()).unwrap_or(d.band_max_step_fraction),
            band_use_limit_orders: std::env::var("BAND_USE_LIMIT_ORDERS").map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes")).unwrap_or(d.band_use_limit_orders),
            trim_stretch_pct: std::env::var("TRIM_STRETCH_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.trim_stretch_pct),
            trim_fraction: std::env::var("TRIM_FRACTION").ok().and_then(|v| v.parse().ok()).unwrap_or(d.trim_fraction),
            exit_max_position_fraction: std::env::var("EXIT_MAX_POSITION_FRACTION").ok().and_then(|v| v.parse().ok()).unwrap_or(d.exit_max_position_fraction),
            exit_min_confidence: std::env::var("EXIT_MIN_CONFIDENCE").ok().and_then(|v| v.parse().ok()).unwrap_or(d.exit_min_confidence),
            circuit_threshold: std::env::var("CIRCUIT_THRESHOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(d.circuit_threshold),
            idle_backoff_ms: std::env::var("IDLE_BACKOFF_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.idle_backoff_ms),
            startup_retries: std::env::var("STARTUP_RETRIES").ok().and_then(|v| v.parse().ok()).unwrap_or(d.startup_retries),
        }
    }
}

pub fn now_ts() -> u64 {
    chrono::Utc::now().timestamp() as u64
}
