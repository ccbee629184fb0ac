//! Votes from indicator outputs plus pattern-history statistics into a
//! direction and confidence. Grounded on the teacher's strategy shape
//! (`application::strategies::dual_sma`'s context-struct-in, tagged-signal-
//! out pattern) generalized from a single crossover rule into the full §4.7
//! voting table, with pattern-quality scoring and feature-flag gating
//! layered on top.

use crate::config::feature_flags::FeatureFlags;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Buy,
    Sell,
    Hold,
}

/// One window's worth of indicator outputs the engine votes over.
#[derive(Debug, Clone, Copy)]
pub struct IndicatorBundle {
    pub rsi: f64,
    pub macd_histogram: f64,
    pub ema9: f64,
    pub ema20: f64,
    pub ema50: f64,
    pub price: f64,
    pub bollinger_lower: f64,
    pub bollinger_upper: f64,
    pub two_pole: f64,
    pub volume: f64,
    pub volume_ma: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PatternStats {
    pub uses: u32,
    pub wins: u32,
    pub losses: u32,
    pub total_pnl: f64,
    pub avg_pnl: f64,
}

/// The out-of-scope ML/pattern-learning store's interface to the core; only
/// this boundary is implemented here (spec §1, §4.7).
pub trait PatternStatsProvider: Send + Sync {
    fn get_stats(&self, pattern_id: &str) -> Option<PatternStats>;
    fn active_pattern_ids(&self) -> Vec<String>;
}

/// In-memory default implementation, sufficient for paper/test/backtest
/// modes where no external pattern store is wired up.
#[derive(Default)]
pub struct InMemoryPatternStats {
    stats: HashMap<String, PatternStats>,
}

impl InMemoryPatternStats {
    pub fn record(&mut self, pattern_id: impl Into<String>, stats: PatternStats) {
        self.stats.insert(pattern_id.into(), stats);
    }
}

impl PatternStatsProvider for InMemoryPatternStats {
    fn get_stats(&self, pattern_id: &str) -> Option<PatternStats> {
        self.stats.get(pattern_id).copied()
    }

    fn active_pattern_ids(&self) -> Vec<String> {
        self.stats.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalOutput {
    pub direction: Direction,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub pattern_quality: f64,
}

impl Serialize for Direction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let s = match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
            Direction::Hold => "HOLD",
        };
        serializer.serialize_str(s)
    }
}

const OVERSOLD: f64 = 30.0;
const OVERBOUGHT: f64 = 70.0;
const MIN_PATTERN_USES: u32 = 5;

pub struct SignalEngine {
    flags: std::sync::Arc<FeatureFlags>,
}

impl SignalEngine {
    pub fn new(flags: std::sync::Arc<FeatureFlags>) -> Self {
        Self { flags }
    }

    /// Implements the §4.7 voting table exactly: each row contributes a
    /// vote to one side and a confidence delta; flagged rows are skipped
    /// (shadow-mode rows still vote internally but are logged as
    /// non-contributing so the reasons list stays auditable).
    pub fn evaluate(&self, bundle: &IndicatorBundle, patterns: &dyn PatternStatsProvider) -> SignalOutput {
        let mut long_votes = 0i32;
        let mut short_votes = 0i32;
        let mut confidence = 0.0f64;
        let mut reasons = Vec::new();

        if bundle.rsi < OVERSOLD {
            long_votes += 1;
            confidence += 15.0;
            reasons.push("rsi_oversold".to_string());
        } else if bundle.rsi > OVERBOUGHT {
            short_votes += 1;
            confidence += 15.0;
            reasons.push("rsi_overbought".to_string());
        }

        if bundle.macd_histogram > 0.0 {
            long_votes += 1;
            confidence += 11.0;
            reasons.push("macd_bullish".to_string());
        } else if bundle.macd_histogram < 0.0 {
            short_votes += 1;
            confidence += 11.0;
            reasons.push("macd_bearish".to_string());
        }

        self.vote_advanced_indicators(bundle, &mut long_votes, &mut short_votes, &mut confidence, &mut reasons);

        if bundle.price <= bundle.bollinger_lower {
            long_votes += 1;
            confidence += 10.0;
            reasons.push("bollinger_lower_touch".to_string());
        } else if bundle.price >= bundle.bollinger_upper {
            short_votes += 1;
            confidence += 10.0;
            reasons.push("bollinger_upper_touch".to_string());
        }

        self.vote_two_pole(bundle, &mut long_votes, &mut short_votes, &mut confidence, &mut reasons);
        self.vote_volume(bundle, &mut confidence, &mut reasons);

        let direction = match long_votes.cmp(&short_votes) {
            std::cmp::Ordering::Greater => Direction::Buy,
            std::cmp::Ordering::Less => Direction::Sell,
            std::cmp::Ordering::Equal => Direction::Hold,
        };

        let pattern_quality = self.pattern_quality(patterns);

        SignalOutput {
            direction,
            confidence: confidence.min(100.0),
            reasons,
            pattern_quality,
        }
    }

    fn vote_advanced_indicators(
        &self,
        bundle: &IndicatorBundle,
        long_votes: &mut i32,
        short_votes: &mut i32,
        confidence: &mut f64,
        reasons: &mut Vec<String>,
    ) {
        if !self.flags.is_enabled("ADVANCED_INDICATORS") {
            return;
        }
        if bundle.ema9 > bundle.ema20 && bundle.ema20 > bundle.ema50 {
            *long_votes += 1;
            *confidence += 18.0;
            reasons.push("ema_stack_bullish".to_string());
        } else if bundle.ema9 < bundle.ema20 && bundle.ema20 < bundle.ema50 {
            *short_votes += 1;
            *confidence += 18.0;
            reasons.push("ema_stack_bearish".to_string());
        }
    }

    fn vote_two_pole(
        &self,
        bundle: &IndicatorBundle,
        long_votes: &mut i32,
        short_votes: &mut i32,
        confidence: &mut f64,
        reasons: &mut Vec<String>,
    ) {
        const THRESHOLD: f64 = 0.5;
        let enabled = self.flags.is_enabled("ML_ENHANCED_SIGNALS");
        let shadow = self.flags.shadow_mode("ML_ENHANCED_SIGNALS");
        if !enabled && !shadow {
            return;
        }
        let would_vote_long = bundle.two_pole > THRESHOLD;
        let would_vote_short = bundle.two_pole < -THRESHOLD;
        if !would_vote_long && !would_vote_short {
            return;
        }
        if shadow && !enabled {
            reasons.push("two_pole_shadow_only".to_string());
            return;
        }
        if would_vote_long {
            *long_votes += 1;
            *confidence += 15.0;
            reasons.push("two_pole_bullish".to_string());
        } else {
            *short_votes += 1;
            *confidence += 15.0;
            reasons.push("two_pole_bearish".to_string());
        }
    }

    fn vote_volume(&self, bundle: &IndicatorBundle, confidence: &mut f64, reasons: &mut Vec<String>) {
        if !self.flags.is_enabled("ML_VOLUME_ANALYSIS") {
            return;
        }
        if bundle.volume_ma > 0.0 && bundle.volume > 1.5 * bundle.volume_ma {
            *confidence += 10.0;
            reasons.push("volume_spike".to_string());
        }
    }

    /// Mean across active patterns with >= 5 uses of
    /// `0.7*(2*winRate-1) + 0.3*tanh(avgPnL/100)`. Patterns below the use
    /// threshold contribute 0, matching spec §4.7 exactly.
    fn pattern_quality(&self, patterns: &dyn PatternStatsProvider) -> f64 {
        let ids = patterns.active_pattern_ids();
        if ids.is_empty() {
            return 0.0;
        }
        let mut total = 0.0;
        for id in &ids {
            total += patterns
                .get_stats(id)
                .map(|s| Self::quality_for(&s))
                .unwrap_or(0.0);
        }
        total / ids.len() as f64
    }

    fn quality_for(stats: &PatternStats) -> f64 {
        if stats.uses < MIN_PATTERN_USES {
            return 0.0;
        }
        let win_rate = stats.wins as f64 / stats.uses as f64;
        0.7 * (2.0 * win_rate - 1.0) + 0.3 * (stats.avg_pnl / 100.0).tanh()
    }

    /// Size multiplier derived from pattern quality, gated on
    /// `PATTERN_BASED_SIZING`. Returns 1.0 (neutral) when the flag is off.
    pub fn size_multiplier(&self, quality: f64) -> f64 {
        if !self.flags.is_enabled("PATTERN_BASED_SIZING") {
            return 1.0;
        }
        if quality <= -0.5 {
            0.25
        } else if quality <= 0.0 {
            0.5
        } else if quality <= 0.5 {
            1.0
        } else {
            1.5
        }
    }
}
