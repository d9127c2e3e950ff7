//! Hierarchical configuration: symbol+side override -> symbol override ->
//! global -> compile-time defaults, per the external configuration contract.
//! Global values load from environment variables, the same
//! `Config::from_env` idiom used throughout this codebase; overrides load
//! from a JSON file and are cached with a short TTL.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::types::{PositionMode, SameDirectionConflictResolution, SignalConflictResolution};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_position_size_pct: Decimal,
    pub max_portfolio_exposure_pct: Decimal,
    pub max_daily_loss_pct: Decimal,
    pub max_daily_trades: u32,
    pub max_concurrent_positions: u32,
    pub max_position_size_usd: Decimal,
    pub min_position_size_usd: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size_pct: Decimal::new(10, 2),
            max_portfolio_exposure_pct: Decimal::new(50, 2),
            max_daily_loss_pct: Decimal::new(5, 2),
            max_daily_trades: 50,
            max_concurrent_positions: 10,
            max_position_size_usd: Decimal::new(10_000, 0),
            min_position_size_usd: Decimal::new(10, 0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    pub min_confidence_threshold: Decimal,
    pub max_signal_age_seconds: i64,
    pub signal_conflict_resolution: SignalConflictResolution,
    pub same_direction_conflict_resolution: SameDirectionConflictResolution,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            min_confidence_threshold: Decimal::new(6, 1),
            max_signal_age_seconds: 300,
            signal_conflict_resolution: SignalConflictResolution::StrongestWins,
            same_direction_conflict_resolution: SameDirectionConflictResolution::Accumulate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeConfig {
    pub position_mode: PositionMode,
    pub position_mode_aware_conflicts: bool,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            position_mode: PositionMode::Hedge,
            position_mode_aware_conflicts: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeightsConfig {
    pub strategy_weights: HashMap<String, Decimal>,
    pub timeframe_weights: HashMap<String, Decimal>,
}

impl WeightsConfig {
    pub fn strategy_weight(&self, strategy_id: &str) -> Decimal {
        self.strategy_weights
            .get(strategy_id)
            .copied()
            .unwrap_or(Decimal::ONE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub default_order_type: crate::types::OrderType,
    pub time_in_force: crate::types::TimeInForce,
    pub leverage: u32,
    pub margin_type: String,
    pub slippage_tolerance_pct: Decimal,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff_multiplier: Decimal,
    pub request_timeout_ms: u64,
    pub lock_acquire_timeout_ms: u64,
    pub lock_ttl_seconds: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_order_type: crate::types::OrderType::Market,
            time_in_force: crate::types::TimeInForce::GTC,
            leverage: 1,
            margin_type: "ISOLATED".to_string(),
            slippage_tolerance_pct: Decimal::new(5, 3),
            max_retries: 3,
            retry_delay_ms: 1000,
            retry_backoff_multiplier: Decimal::TWO,
            request_timeout_ms: 5000,
            lock_acquire_timeout_ms: 300,
            lock_ttl_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    pub quantity_multiplier: Decimal,
    pub use_exchange_minimums: bool,
    pub override_min_notional: Option<Decimal>,
    pub override_min_qty: Option<Decimal>,
    pub override_step_size: Option<Decimal>,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            quantity_multiplier: Decimal::ONE,
            use_exchange_minimums: true,
            override_min_notional: None,
            override_min_qty: None,
            override_step_size: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchesConfig {
    pub enabled: bool,
    pub enable_longs: bool,
    pub enable_shorts: bool,
    pub risk_management_enabled: bool,
    pub simulation_enabled: bool,
}

impl Default for SwitchesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_longs: true,
            enable_shorts: true,
            risk_management_enabled: true,
            simulation_enabled: true,
        }
    }
}

/// The fully-resolved set of knobs for one (symbol, side) lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolvedConfig {
    pub risk: RiskConfig,
    pub signal: SignalConfig,
    pub mode: ModeConfig,
    pub weights: WeightsConfig,
    pub execution: ExecutionConfig,
    pub sizing: SizingConfig,
    pub switches: SwitchesConfig,
}

/// Sparse override applied on top of the global `ResolvedConfig`. Every field
/// is optional; `None` means "inherit from the parent level".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverride {
    pub max_position_size_pct: Option<Decimal>,
    pub max_position_size_usd: Option<Decimal>,
    pub min_position_size_usd: Option<Decimal>,
    pub min_confidence_threshold: Option<Decimal>,
    pub position_mode: Option<PositionMode>,
    pub quantity_multiplier: Option<Decimal>,
    pub enabled: Option<bool>,
    pub enable_longs: Option<bool>,
    pub enable_shorts: Option<bool>,
}

impl ConfigOverride {
    fn apply(&self, base: &mut ResolvedConfig) {
        if let Some(v) = self.max_position_size_pct {
            base.risk.max_position_size_pct = v;
        }
        if let Some(v) = self.max_position_size_usd {
            base.risk.max_position_size_usd = v;
        }
        if let Some(v) = self.min_position_size_usd {
            base.risk.min_position_size_usd = v;
        }
        if let Some(v) = self.min_confidence_threshold {
            base.signal.min_confidence_threshold = v;
        }
        if let Some(v) = self.position_mode {
            base.mode.position_mode = v;
        }
        if let Some(v) = self.quantity_multiplier {
            base.sizing.quantity_multiplier = v;
        }
        if let Some(v) = self.enabled {
            base.switches.enabled = v;
        }
        if let Some(v) = self.enable_longs {
            base.switches.enable_longs = v;
        }
        if let Some(v) = self.enable_shorts {
            base.switches.enable_shorts = v;
        }
    }
}

/// On-disk shape of the overrides file: a flat list keyed by symbol, and
/// optionally symbol+side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OverridesFile {
    #[serde(default)]
    symbol: HashMap<String, ConfigOverride>,
    #[serde(default)]
    symbol_side: HashMap<String, ConfigOverride>,
}

struct OverridesCache {
    file: OverridesFile,
    loaded_at: Instant,
}

/// Process-wide configuration resolver. Holds the global defaults (loaded
/// once from the environment at startup) plus a TTL-cached view of the
/// overrides file, refreshed on every `resolve` call once the TTL expires.
pub struct ConfigResolver {
    global: ResolvedConfig,
    overrides_path: Option<PathBuf>,
    cache: RwLock<OverridesCache>,
    ttl: Duration,
}

impl ConfigResolver {
    pub fn from_env() -> Self {
        let global = ResolvedConfig {
            risk: RiskConfig {
                max_position_size_pct: env_decimal("MAX_POSITION_SIZE_PCT", Decimal::new(10, 2)),
                max_portfolio_exposure_pct: env_decimal("MAX_PORTFOLIO_EXPOSURE_PCT", Decimal::new(50, 2)),
                max_daily_loss_pct: env_decimal("MAX_DAILY_LOSS_PCT", Decimal::new(5, 2)),
                max_daily_trades: env_u32("MAX_DAILY_TRADES", 50),
                max_concurrent_positions: env_u32("MAX_CONCURRENT_POSITIONS", 10),
                max_position_size_usd: env_decimal("MAX_POSITION_SIZE_USD", Decimal::new(10_000, 0)),
                min_position_size_usd: env_decimal("MIN_POSITION_SIZE_USD", Decimal::new(10, 0)),
            },
            signal: SignalConfig {
                min_confidence_threshold: env_decimal("MIN_CONFIDENCE_THRESHOLD", Decimal::new(6, 1)),
                max_signal_age_seconds: env_i64("MAX_SIGNAL_AGE_SECONDS", 300),
                signal_conflict_resolution: SignalConflictResolution::StrongestWins,
                same_direction_conflict_resolution: SameDirectionConflictResolution::Accumulate,
            },
            mode: ModeConfig {
                position_mode: if std::env::var("ONE_WAY_MODE").map(|v| v == "1").unwrap_or(false) {
                    PositionMode::OneWay
                } else {
                    PositionMode::Hedge
                },
                position_mode_aware_conflicts: true,
            },
            weights: WeightsConfig::default(),
            execution: ExecutionConfig::default(),
            sizing: SizingConfig::default(),
            switches: SwitchesConfig {
                enabled: env_bool("ENABLED", true),
                enable_longs: env_bool("ENABLE_LONGS", true),
                enable_shorts: env_bool("ENABLE_SHORTS", true),
                risk_management_enabled: env_bool("RISK_MANAGEMENT_ENABLED", true),
                simulation_enabled: env_bool("SIMULATION_ENABLED", true),
            },
        };

        let overrides_path = std::env::var("CONFIG_OVERRIDES_PATH").ok().map(PathBuf::from);
        let ttl = Duration::from_secs(env_u32("CONFIG_TTL_SECONDS", 60) as u64);

        let file = overrides_path
            .as_ref()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();

        Self {
            global,
            overrides_path,
            cache: RwLock::new(OverridesCache {
                file,
                loaded_at: Instant::now(),
            }),
            ttl,
        }
    }

    /// Build a resolver around an already-constructed global config, with no
    /// overrides file backing it. Used by integration tests that need a
    /// `ResolvedConfig` other than the environment defaults.
    #[cfg(test)]
    pub fn with_global(global: ResolvedConfig) -> Self {
        Self {
            global,
            overrides_path: None,
            cache: RwLock::new(OverridesCache {
                file: OverridesFile::default(),
                loaded_at: Instant::now(),
            }),
            ttl: Duration::from_secs(60),
        }
    }

    fn refresh_if_stale(&self) {
        let stale = {
            let cache = self.cache.read().unwrap();
            cache.loaded_at.elapsed() > self.ttl
        };
        if !stale {
            return;
        }
        let Some(path) = &self.overrides_path else {
            return;
        };
        if let Ok(contents) = std::fs::read_to_string(path) {
            if let Ok(file) = serde_json::from_str::<OverridesFile>(&contents) {
                let mut cache = self.cache.write().unwrap();
                cache.file = file;
                cache.loaded_at = Instant::now();
            }
        }
    }

    /// Resolve effective config for a symbol+side: symbol+side override wins
    /// over symbol override wins over global.
    pub fn resolve(&self, symbol: &str, side: crate::types::PositionSide) -> ResolvedConfig {
        self.refresh_if_stale();
        let mut resolved = self.global.clone();
        let cache = self.cache.read().unwrap();
        if let Some(ov) = cache.file.symbol.get(symbol) {
            ov.apply(&mut resolved);
        }
        let key = format!("{}_{}", symbol, side);
        if let Some(ov) = cache.file.symbol_side.get(&key) {
            ov.apply(&mut resolved);
        }
        resolved
    }

    pub fn global(&self) -> &ResolvedConfig {
        &self.global
    }
}

fn env_decimal(key: &str, default: Decimal) -> Decimal {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}
