//! Per-position exit state machine: tiered partial exits, trailing stop,
//! breakeven stop, time-based exit. A pure function of price/time updates,
//! independent of any adapter.
//!
//! Grounded on the teacher's `application::risk_management::trailing_stops`
//! `StopState` state machine (tighten-only stop, `on_buy`/`on_price_update`/
//! `on_sell`) and `position_manager`'s tier bookkeeping, generalized from a
//! single ATR-multiple stop into the full §4.8 state machine: tier targets,
//! breakeven arming and a time-based exit alongside the trailing stop.

use crate::domain::order::OrderSide;
use crate::domain::position::{CompletedTier, Tier};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// 20-period-return-stddev regime used to scale stop/target/trail distances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolatilityClass {
    Low,
    Normal,
    High,
}

impl VolatilityClass {
    pub fn classify(volatility_fraction: f64) -> Self {
        if volatility_fraction >= 0.02 {
            VolatilityClass::High
        } else if volatility_fraction < 0.005 {
            VolatilityClass::Low
        } else {
            VolatilityClass::Normal
        }
    }

    /// (stop_mult, target_mult, trail_mult)
    pub fn multipliers(&self) -> (Decimal, Decimal, Decimal) {
        match self {
            VolatilityClass::High => (dec!(1.5), dec!(1.4), dec!(1.3)),
            VolatilityClass::Low => (dec!(0.7), dec!(0.8), dec!(0.7)),
            VolatilityClass::Normal => (Decimal::ONE, Decimal::ONE, Decimal::ONE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Hold,
    Update,
    ExitPartial,
    ExitFull,
}

/// The only thing a `ProfitManager` ever returns. It never places orders
/// itself — the orchestrator executes the directive.
#[derive(Debug, Clone)]
pub struct Directive {
    pub action: Action,
    pub reason: String,
    pub size: Option<Decimal>,
    pub stop: Option<Decimal>,
    pub tier: Option<usize>,
}

impl Directive {
    fn hold(reason: &str) -> Self {
        Self { action: Action::Hold, reason: reason.to_string(), size: None, stop: None, tier: None }
    }

    fn update(reason: &str, stop: Decimal) -> Self {
        Self { action: Action::Update, reason: reason.to_string(), size: None, stop: Some(stop), tier: None }
    }

    fn exit_partial(reason: &str, size: Decimal, tier: usize) -> Self {
        Self { action: Action::ExitPartial, reason: reason.to_string(), size: Some(size), stop: None, tier: Some(tier) }
    }

    fn exit_full(reason: &str) -> Self {
        Self { action: Action::ExitFull, reason: reason.to_string(), size: None, stop: None, tier: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    TrailingArmed,
    BreakevenArmed,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct ProfitManagerConfig {
    pub stop_loss_pct: Decimal,
    pub trail_distance_pct: Decimal,
    pub min_profit_pct: Decimal,
    pub breakeven_threshold_pct: Decimal,
    pub fee_buffer_pct: Decimal,
    pub max_hold_minutes: i64,
    pub enable_time_based_adjustments: bool,
    pub min_hold_minutes: f64,
}

impl Default for ProfitManagerConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: dec!(0.02),
            trail_distance_pct: dec!(0.002),
            min_profit_pct: dec!(0.003),
            breakeven_threshold_pct: dec!(0.002),
            fee_buffer_pct: dec!(0.001),
            max_hold_minutes: 180,
            enable_time_based_adjustments: true,
            min_hold_minutes: 0.05,
        }
    }
}

/// One instance per open position.
pub struct ProfitManager {
    side: OrderSide,
    entry_price: Decimal,
    original_size: Decimal,
    entry_time_ms: i64,
    high_water: Decimal,
    low_water: Decimal,
    current_stop: Decimal,
    initial_stop: Decimal,
    trailing_active: bool,
    breakeven_active: bool,
    tiers: Vec<Tier>,
    completed_tiers: Vec<CompletedTier>,
    phase: Phase,
    config: ProfitManagerConfig,
}

impl ProfitManager {
    /// Installs the initial stop and tier targets. `stop_factor` scales the
    /// initial stop distance; `vol_factor`, `market_mult` and
    /// `confidence_mult` scale the tier target percents, per spec §4.8
    /// (`initial stop = entry · (1 − stopLossPct·volFactor)`; `tiers[i] =
    /// targetPct[i]·volFactor·marketMult·confidenceMult`).
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        side: OrderSide,
        entry_price: Decimal,
        original_size: Decimal,
        entry_time_ms: i64,
        target_pcts: &[Decimal],
        exit_fractions: &[Decimal],
        stop_factor: Decimal,
        vol_factor: Decimal,
        market_mult: Decimal,
        confidence_mult: Decimal,
        config: ProfitManagerConfig,
    ) -> Self {
        let direction = match side {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => -Decimal::ONE,
        };
        let initial_stop = entry_price * (Decimal::ONE - direction * config.stop_loss_pct * stop_factor);
        let tiers: Vec<Tier> = target_pcts
            .iter()
            .zip(exit_fractions.iter())
            .enumerate()
            .map(|(i, (pct, frac))| {
                let scaled_pct = *pct * vol_factor * market_mult * confidence_mult;
                Tier {
                    index: i,
                    target_pct: scaled_pct,
                    target_price: entry_price * (Decimal::ONE + direction * scaled_pct),
                    exit_fraction: *frac,
                    completed: false,
                }
            })
            .collect();

        Self {
            side,
            entry_price,
            original_size,
            entry_time_ms,
            high_water: entry_price,
            low_water: entry_price,
            current_stop: initial_stop,
            initial_stop,
            trailing_active: false,
            breakeven_active: false,
            tiers,
            completed_tiers: Vec::new(),
            phase: Phase::Open,
            config,
        }
    }

    fn direction(&self) -> Decimal {
        match self.side {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => -Decimal::ONE,
        }
    }

    fn unrealized_gain_pct(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        self.direction() * (price - self.entry_price) / self.entry_price
    }

    /// True when `candidate` is a strictly better (tighter, closer to
    /// favorable) stop than the current one — the monotonicity invariant of
    /// spec §8 ("the trailing stop is monotonic per position").
    fn is_tighter_stop(&self, candidate: Decimal) -> bool {
        match self.side {
            OrderSide::Buy => candidate > self.current_stop,
            OrderSide::Sell => candidate < self.current_stop,
        }
    }

    fn stop_breached(&self, price: Decimal) -> bool {
        match self.side {
            OrderSide::Buy => price < self.current_stop,
            OrderSide::Sell => price > self.current_stop,
        }
    }

    fn remaining_size(&self) -> Decimal {
        let completed: Decimal = self.completed_tiers.iter().map(|t| t.exit_size).sum();
        (self.original_size - completed).max(Decimal::ZERO)
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Feed a new price/time sample, volatility classification included.
    /// Returns the single directive the orchestrator should act on this
    /// tick; at most one directive is returned even if several conditions
    /// would otherwise fire, in priority order: stop, tier, trailing/
    /// breakeven arming, time exit, hold.
    pub fn on_price_update(&mut self, price: Decimal, now_ms: i64, volatility: VolatilityClass) -> Directive {
        if self.phase == Phase::Closed {
            return Directive::hold("already_closed");
        }

        let held_minutes = (now_ms - self.entry_time_ms) as f64 / 60_000.0;
        if held_minutes < self.config.min_hold_minutes {
            return Directive::hold("min_hold_guard");
        }

        if price > self.high_water {
            self.high_water = price;
        }
        if price < self.low_water {
            self.low_water = price;
        }

        let (_stop_mult, _target_mult, trail_mult) = volatility.multipliers();
        // tier targets are scaled once at `open()`; only the live trailing
        // distance reacts to a volatility regime shift mid-position.

        if self.stop_breached(price) {
            let reason = if self.trailing_active { "trailing_stop" } else { "stop_loss" };
            self.phase = Phase::Closed;
            return Directive::exit_full(reason);
        }

        if let Some(directive) = self.check_tier_exit(price, now_ms) {
            return directive;
        }

        if self.trailing_active {
            let trail_distance = self.config.trail_distance_pct * trail_mult;
            let candidate = self.high_water * (Decimal::ONE - self.direction() * trail_distance);
            if self.is_tighter_stop(candidate) {
                self.current_stop = candidate;
            }
        }

        if !self.breakeven_active && self.unrealized_gain_pct(price) >= self.config.breakeven_threshold_pct {
            let candidate = self.entry_price * (Decimal::ONE + self.direction() * self.config.fee_buffer_pct);
            if self.is_tighter_stop(candidate) {
                self.current_stop = candidate;
                self.breakeven_active = true;
                self.phase = Phase::BreakevenArmed;
                return Directive::update("breakeven_armed", self.current_stop);
            }
            self.breakeven_active = true;
        }

        if !self.trailing_active && self.unrealized_gain_pct(price) >= self.config.min_profit_pct {
            self.trailing_active = true;
            self.phase = Phase::TrailingArmed;
            let trail_distance = self.config.trail_distance_pct * trail_mult;
            let candidate = self.high_water * (Decimal::ONE - self.direction() * trail_distance);
            if self.is_tighter_stop(candidate) {
                self.current_stop = candidate;
            }
            return Directive::update("trailing_armed", self.current_stop);
        }

        if self.config.enable_time_based_adjustments
            && now_ms - self.entry_time_ms >= self.config.max_hold_minutes * 60_000
        {
            self.phase = Phase::Closed;
            return Directive::exit_full("time_exit");
        }

        Directive::hold("no_condition_met")
    }

    fn check_tier_exit(&mut self, price: Decimal, now_ms: i64) -> Option<Directive> {
        for i in 0..self.tiers.len() {
            let crossed = match self.side {
                OrderSide::Buy => price >= self.tiers[i].target_price,
                OrderSide::Sell => price <= self.tiers[i].target_price,
            };
            if crossed && !self.tiers[i].completed {
                let tier = &mut self.tiers[i];
                tier.completed = true;
                let exit_size = tier.exit_fraction * self.original_size;
                let realized = exit_size * self.entry_price * tier.target_pct;
                self.completed_tiers.push(CompletedTier {
                    index: tier.index,
                    exit_price: price,
                    exit_size,
                    realized_pnl: realized,
                    timestamp_ms: now_ms,
                });

                if self.remaining_size().is_zero() || i == self.tiers.len() - 1 {
                    self.phase = Phase::Closed;
                }

                return Some(Directive::exit_partial("tier_exit", exit_size, i));
            }
        }
        None
    }
}
