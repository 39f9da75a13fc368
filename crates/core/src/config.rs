use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub risk: RiskConfig,
    pub exit: ExitConfig,
    pub roll: RollConfig,
    pub advisory: AdvisoryConfig,
}

/// Scheduling and order-wait settings for the service loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Exit monitor cadence (seconds).
    pub exit_interval_secs: u64,
    /// Roll manager cadence (seconds).
    pub roll_interval_secs: u64,
    /// Periodic reconciliation cadence (seconds). `None` disables the
    /// periodic pass; the startup pass always runs.
    pub reconcile_interval_secs: Option<u64>,
    /// Bounded wait for a fill confirmation before cancelling (seconds).
    pub fill_timeout_secs: u64,
    /// Order status polling interval while waiting for a fill (ms).
    pub order_poll_interval_ms: u64,
}

/// Portfolio-level exposure ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Maximum absolute beta-weighted delta across the portfolio.
    pub max_beta_weighted_delta: Decimal,
    /// Maximum absolute net delta (non-beta-weighted).
    pub max_net_delta: Decimal,
    /// One-sided (bullish or bearish) exposure ceiling, as a fraction of
    /// `max_beta_weighted_delta`.
    pub directional_fraction: Decimal,
}

/// Exit monitor rule thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    /// Force-close any position at or below this many days to expiration.
    pub time_exit_dte: i64,
    /// Whether the advisory exit signal participates as rule 4.
    pub advisory_exits_enabled: bool,
    /// Take-profit level as a fraction of entry credit (e.g. 0.50 = buy
    /// back at half the credit received). Used when deriving exit rules
    /// for roll-created and newly opened positions.
    pub take_profit_fraction: Decimal,
    /// Stop-loss level as a multiple of entry credit (e.g. 2.5x).
    pub stop_loss_multiplier: Decimal,
}

/// Roll trigger and replacement-leg settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollConfig {
    /// A short strike counts as tested when the underlying is within this
    /// fraction of it (e.g. 0.02 = 2%).
    pub strike_proximity_pct: Decimal,
    /// Absolute delta on a tested short leg that triggers a roll.
    pub delta_breach_threshold: Decimal,
    /// DTE floor below which unfavorable greeks trigger a time roll.
    pub dte_floor: i64,
    /// Replacement legs expire at the nearest listed date with at least
    /// this many days to expiration.
    pub target_min_dte: i64,
}

/// Advisory service gating for new positions and exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisoryConfig {
    /// Minimum advisory confidence (1..=10) to open a new position.
    pub min_confidence: u8,
    /// Whether the advisory gate is consulted at all.
    pub enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            risk: RiskConfig::default(),
            exit: ExitConfig::default(),
            roll: RollConfig::default(),
            advisory: AdvisoryConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            exit_interval_secs: 30,
            roll_interval_secs: 60,
            reconcile_interval_secs: Some(3600),
            fill_timeout_secs: 30,
            order_poll_interval_ms: 500,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_beta_weighted_delta: Decimal::from(100),
            max_net_delta: Decimal::from(50),
            directional_fraction: Decimal::new(80, 2),
        }
    }
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            time_exit_dte: 7,
            advisory_exits_enabled: true,
            take_profit_fraction: Decimal::new(50, 2),
            stop_loss_multiplier: Decimal::new(25, 1),
        }
    }
}

impl Default for RollConfig {
    fn default() -> Self {
        Self {
            strike_proximity_pct: Decimal::new(2, 2),
            delta_breach_threshold: Decimal::new(40, 2),
            dte_floor: 21,
            target_min_dte: 45,
        }
    }
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            min_confidence: 7,
            enabled: true,
        }
    }
}
