//! Process configuration: execution mode detection and tier limits.
//!
//! Mirrors the teacher's `config` split — environment-derived structs
//! aggregated into a single `Config` — but scoped to what the engine
//! actually needs: mode, tier and data-directory plumbing. Per-broker
//! credentials live with each adapter.

pub mod feature_flags;

pub use feature_flags::FeatureFlags;

use std::env;
use std::str::FromStr;

/// Controls side effects: persistence, live order placement, reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Backtest,
    Test,
    Paper,
    Live,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Paper
    }
}

impl FromStr for Mode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "backtest" => Ok(Mode::Backtest),
            "test" => Ok(Mode::Test),
            "paper" => Ok(Mode::Paper),
            "live" => Ok(Mode::Live),
            _ => Err(()),
        }
    }
}

impl Mode {
    /// Detect mode from the environment variables named in spec §6. Order of
    /// precedence: explicit BACKTEST_MODE / TEST_MODE flags win over
    /// TRADING_MODE, which wins over ENABLE_LIVE_TRADING / PAPER_TRADING,
    /// defaulting to `Paper`.
    pub fn detect() -> Mode {
        if env_flag("BACKTEST_MODE") {
            return Mode::Backtest;
        }
        if env_flag("TEST_MODE") {
            return Mode::Test;
        }
        if let Ok(v) = env::var("TRADING_MODE") {
            if let Ok(m) = Mode::from_str(&v) {
                return m;
            }
        }
        if env_flag("ENABLE_LIVE_TRADING") {
            return Mode::Live;
        }
        if env_flag("PAPER_TRADING") {
            return Mode::Paper;
        }
        Mode::Paper
    }

    /// `backtest` mode skips disk persistence (spec §4.4).
    pub fn skips_persistence(&self) -> bool {
        matches!(self, Mode::Backtest)
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes")
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Starter,
    Pro,
    Elite,
    Ml,
}

impl FromStr for Tier {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starter" => Ok(Tier::Starter),
            "pro" => Ok(Tier::Pro),
            "elite" => Ok(Tier::Elite),
            "ml" => Ok(Tier::Ml),
            _ => Err(()),
        }
    }
}

impl Tier {
    pub fn detect() -> Tier {
        env::var("TRADING_TIER")
            .ok()
            .and_then(|v| Tier::from_str(&v).ok())
            .unwrap_or(Tier::Starter)
    }

    pub fn max_positions(&self) -> u32 {
        match self {
            Tier::Starter => 1,
            Tier::Pro => 3,
            Tier::Elite => 10,
            Tier::Ml => 20,
        }
    }

    pub fn max_daily_trades(&self) -> u32 {
        match self {
            Tier::Starter => 5,
            Tier::Pro => 20,
            Tier::Elite => 100,
            Tier::Ml => 500,
        }
    }

    pub fn leverage(&self) -> rust_decimal::Decimal {
        use rust_decimal_macros::dec;
        match self {
            Tier::Starter => dec!(1),
            Tier::Pro => dec!(2),
            Tier::Elite => dec!(3),
            Tier::Ml => dec!(3),
        }
    }

    pub fn pattern_limit(&self) -> usize {
        match self {
            Tier::Starter => 20,
            Tier::Pro => 100,
            Tier::Elite => 500,
            Tier::Ml => 2000,
        }
    }
}

/// Top-level aggregate, constructed once at boot.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub tier: Tier,
    pub data_dir: String,
    pub config_dir: String,
    pub logs_dir: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            mode: Mode::detect(),
            tier: Tier::detect(),
            data_dir: env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            config_dir: env::var("CONFIG_DIR").unwrap_or_else(|_| "./config".to_string()),
            logs_dir: env::var("LOGS_DIR").unwrap_or_else(|_| "./logs".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_limits_are_non_decreasing_with_tier() {
        let tiers = [Tier::Starter, Tier::Pro, Tier::Elite, Tier::Ml];
        for w in tiers.windows(2) {
            assert!(w[0].max_positions() <= w[1].max_positions());
            assert!(w[0].max_daily_trades() <= w[1].max_daily_trades());
        }
    }

    #[test]
    fn mode_from_str_is_case_insensitive() {
        assert_eq!(Mode::from_str("LIVE").unwrap(), Mode::Live);
        assert_eq!(Mode::from_str("paper").unwrap(), Mode::Paper);
    }
}
