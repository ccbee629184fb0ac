//! Single source of truth for balance, position and active trades.
//!
//! Mirrors the teacher's `domain::risk::state` + `infrastructure::
//! settings_persistence` pair: one owner struct guarded by a lock that
//! serializes every mutation, atomic write-temp-then-rename JSON
//! persistence, and a bounded transaction log. The listener fan-out
//! follows the teacher's bootstrap channel style (`mpsc::Sender`
//! broadcast) but notifies synchronously, inside the mutation's critical
//! section, per spec §5 ("the previously-stale dashboard fan-out bug is
//! the explicit motivation for this ordering").

use crate::config::Mode;
use crate::domain::account::{AccountState, Trade};
use crate::domain::errors::StateError;
use crate::domain::order::OrderSide;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, info, warn};

const TRANSACTION_LOG_CAPACITY: usize = 100;

/// One entry in the bounded transaction log, enough to audit what mutated
/// the account and when without replaying full before/after snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionLogEntry {
    pub ts_ms: i64,
    pub operation: String,
    pub reason: Option<String>,
}

/// Outward notification payload. Mirrors the §6 dashboard wire shape; no
/// transport is wired up (the dashboard is out of scope), only the type.
#[derive(Debug, Clone, Serialize)]
pub struct StateUpdateMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub source: &'static str,
    pub updates: String,
    pub state: PersistedState,
    pub timestamp: i64,
}

pub trait StateListener: Send + Sync {
    fn on_update(&self, message: &StateUpdateMessage);
}

/// On-disk schema (§6): `activeTrades` serializes as an array of entries
/// rather than a JSON object, so round-tripping preserves the insertion
/// order `AccountState`'s `IndexMap` already keeps internally instead of
/// re-sorting by order id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub balance: Decimal,
    pub total_balance: Decimal,
    pub in_position: Decimal,
    pub position: Decimal,
    pub entry_price: Decimal,
    pub entry_time: Option<i64>,
    pub active_trades: Vec<(String, Trade)>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_pnl: Decimal,
    pub trade_count: u32,
    pub daily_trade_count: u32,
    pub is_trading: bool,
    pub recovery_mode: bool,
    pub last_update: i64,
    pub paused_at: Option<i64>,
    pub pause_reason: Option<String>,
}

struct Inner {
    state: AccountState,
    entry_time_ms: Option<i64>,
    trade_count: u32,
    log: VecDeque<TransactionLogEntry>,
    last_price: Decimal,
}

/// All mutations funnel through `inner`'s mutex, which is the single
/// serialization point spec §4.4/§5 requires: one mutation executes at a
/// time per process, waiters enqueue in FIFO order via the mutex.
pub struct StateManager {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
    mode: Mode,
    listeners: Mutex<Vec<Box<dyn StateListener>>>,
}

impl StateManager {
    pub fn new(mode: Mode, path: Option<PathBuf>) -> Self {
        let state = if mode.skips_persistence() {
            AccountState::default()
        } else {
            path.as_ref()
                .and_then(|p| Self::load_from_disk(p).ok())
                .unwrap_or_default()
        };
        Self {
            inner: Mutex::new(Inner {
                state,
                entry_time_ms: None,
                trade_count: 0,
                log: VecDeque::with_capacity(TRANSACTION_LOG_CAPACITY),
                last_price: Decimal::ZERO,
            }),
            path,
            mode,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Box<dyn StateListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn load_from_disk(path: &PathBuf) -> Result<AccountState> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading state file at {path:?}"))?;
        let persisted: PersistedState =
            serde_json::from_str(&content).context("parsing state JSON")?;
        Ok(AccountState {
            balance: persisted.balance,
            total_balance: persisted.total_balance,
            in_position: persisted.in_position,
            position: persisted.position,
            entry_price: persisted.entry_price,
            active_trades: persisted.active_trades.into_iter().collect(),
            realized_pnl: persisted.realized_pnl,
            is_trading: persisted.is_trading,
            recovery_mode: persisted.recovery_mode,
            last_update_ms: persisted.last_update,
            daily_trade_count: persisted.daily_trade_count,
            paused_at: persisted.paused_at,
            pause_reason: persisted.pause_reason,
        })
    }

    /// Snapshot a fully-owned copy. Readers never hold a lock across an
    /// await point — they copy and release immediately.
    pub fn snapshot(&self) -> AccountState {
        self.inner.lock().unwrap().state.clone()
    }

    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        self.inner.lock().unwrap().state.unrealized_pnl(current_price)
    }

    pub fn total_pnl(&self, current_price: Decimal) -> Decimal {
        self.inner.lock().unwrap().state.total_pnl(current_price)
    }

    /// Runs `mutate` against a cloned copy of the state; on success the copy
    /// replaces the live state (persisted state otherwise stays untouched —
    /// "if any step throws, the snapshot is restored"), stamps
    /// `lastUpdateMs`, logs, notifies listeners and persists.
    fn mutate(
        &self,
        operation: &str,
        reason: Option<String>,
        now_ms: i64,
        mutate: impl FnOnce(&mut Inner) -> Result<(), StateError>,
    ) -> Result<(), StateError> {
        let mut guard = self.inner.lock().unwrap();
        let before = guard.state.clone();

        let result = mutate(&mut guard);
        if let Err(e) = result {
            guard.state = before;
            warn!("state mutation '{operation}' rejected: {e}");
            return Err(e);
        }

        guard.state.last_update_ms = now_ms;

        if guard.log.len() >= TRANSACTION_LOG_CAPACITY {
            guard.log.pop_front();
        }
        guard.log.push_back(TransactionLogEntry {
            ts_ms: now_ms,
            operation: operation.to_string(),
            reason: reason.clone(),
        });

        let message = StateUpdateMessage {
            kind: "state_update",
            source: "StateManager",
            updates: operation.to_string(),
            state: self.to_persisted(&guard),
            timestamp: now_ms,
        };
        drop(guard);

        for listener in self.listeners.lock().unwrap().iter() {
            // Listener panics must never affect state — catch_unwind keeps a
            // buggy dashboard consumer from poisoning the trading loop.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_update(&message);
            }));
            if result.is_err() {
                error!("state listener panicked; ignoring");
            }
        }

        if !self.mode.skips_persistence() {
            if let Err(e) = self.persist() {
                warn!("failed to persist state: {e}");
            }
        }

        Ok(())
    }

    fn to_persisted(&self, inner: &Inner) -> PersistedState {
        let unrealized = inner.state.unrealized_pnl(inner.last_price);
        PersistedState {
            balance: inner.state.balance,
            total_balance: inner.state.total_balance,
            in_position: inner.state.in_position,
            position: inner.state.position,
            entry_price: inner.state.entry_price,
            entry_time: inner.entry_time_ms,
            active_trades: inner
                .state
                .active_trades
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            realized_pnl: inner.state.realized_pnl,
            unrealized_pnl: unrealized,
            total_pnl: inner.state.realized_pnl + unrealized,
            trade_count: inner.trade_count,
            daily_trade_count: inner.state.daily_trade_count,
            is_trading: inner.state.is_trading,
            recovery_mode: inner.state.recovery_mode,
            last_update: inner.state.last_update_ms,
            paused_at: inner.state.paused_at,
            pause_reason: inner.state.pause_reason.clone(),
        }
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        let persisted = {
            let guard = self.inner.lock().unwrap();
            self.to_persisted(&guard)
        };
        let content = serde_json::to_string_pretty(&persisted).context("serializing state")?;
        let temp_path = path.with_extension("tmp");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        std::fs::write(&temp_path, content).context("writing temp state file")?;
        std::fs::rename(&temp_path, path).context("renaming temp state file")?;
        info!("persisted state to {path:?}");
        Ok(())
    }

    /// Opens (or adds to) the single-symbol position. Weighted-average entry
    /// price if already open.
    pub fn open_position(
        &self,
        size_base: Decimal,
        price: Decimal,
        order_id: String,
        now_ms: i64,
    ) -> Result<(), StateError> {
        self.mutate("open_position", None, now_ms, |inner| {
            let cost = size_base * price;
            if inner.state.balance - cost < Decimal::ZERO {
                return Err(StateError::NegativeBalance {
                    balance: inner.state.balance - cost,
                });
            }
            let existing_size = inner.state.position;
            let new_size = existing_size + size_base;
            inner.state.entry_price = if existing_size.is_zero() {
                price
            } else {
                (inner.state.entry_price * existing_size + price * size_base) / new_size
            };
            inner.state.position = new_size;
            inner.state.in_position = new_size * inner.state.entry_price;
            inner.state.balance -= cost;
            inner.state.total_balance = inner.state.balance + inner.state.in_position;
            if inner.entry_time_ms.is_none() {
                inner.entry_time_ms = Some(now_ms);
            }
            inner.state.active_trades.insert(
                order_id.clone(),
                Trade {
                    order_id,
                    action: OrderSide::Buy,
                    size: size_base,
                    price,
                    entry_price: inner.state.entry_price,
                    entry_time_ms: now_ms,
                },
            );
            inner.trade_count += 1;
            inner.state.daily_trade_count += 1;
            inner.last_price = price;
            Ok(())
        })
    }

    /// Closes all or part of the position. `realizedPnL +=
    /// closedSize · entryPrice · pct` per spec §4.4's price-change-percent
    /// model.
    pub fn close_position(
        &self,
        price: Decimal,
        partial: bool,
        size: Option<Decimal>,
        order_id: String,
        now_ms: i64,
    ) -> Result<(), StateError> {
        self.mutate("close_position", None, now_ms, |inner| {
            if inner.state.position.is_zero() {
                return Ok(());
            }
            let closed_size = size.unwrap_or(inner.state.position).min(inner.state.position);
            let remaining = inner.state.position - closed_size;
            if remaining.is_sign_negative() {
                return Err(StateError::NegativePosition { position: remaining });
            }
            let pct = if inner.state.entry_price.is_zero() {
                Decimal::ZERO
            } else {
                (price - inner.state.entry_price) / inner.state.entry_price
            };
            let pnl = closed_size * inner.state.entry_price * pct;
            inner.state.realized_pnl += pnl;
            inner.state.balance += closed_size * price;
            inner.state.position = remaining;
            inner.state.in_position = remaining * inner.state.entry_price;
            inner.state.total_balance = inner.state.balance + inner.state.in_position;

            inner.state.active_trades.insert(
                order_id.clone(),
                Trade {
                    order_id,
                    action: OrderSide::Sell,
                    size: closed_size,
                    price,
                    entry_price: inner.state.entry_price,
                    entry_time_ms: now_ms,
                },
            );

            if !partial || remaining.is_zero() {
                inner.state.entry_price = Decimal::ZERO;
                inner.entry_time_ms = None;
                inner
                    .state
                    .active_trades
                    .retain(|_, t| t.action != OrderSide::Buy);
            }
            inner.last_price = price;
            Ok(())
        })
    }

    pub fn update_balance(&self, delta: Decimal, reason: String, now_ms: i64) -> Result<(), StateError> {
        self.mutate("update_balance", Some(reason), now_ms, |inner| {
            let new_balance = inner.state.balance + delta;
            if new_balance.is_sign_negative() {
                return Err(StateError::NegativeBalance { balance: new_balance });
            }
            inner.state.balance = new_balance;
            inner.state.total_balance = new_balance + inner.state.in_position;
            Ok(())
        })
    }

    /// Small/none-severity drift auto-correction: `updateState({balance,
    /// position})` with source=reconciliation (spec §4.6). Does not touch
    /// entry price or active trades — the reconciler only nudges the
    /// scalar fields it fetched from the venue.
    pub fn apply_reconciliation(
        &self,
        balance: Decimal,
        position: Decimal,
        now_ms: i64,
    ) -> Result<(), StateError> {
        self.mutate("reconciliation_correction", Some("reconciliation".to_string()), now_ms, |inner| {
            if balance.is_sign_negative() {
                return Err(StateError::NegativeBalance { balance });
            }
            if position.is_sign_negative() {
                return Err(StateError::NegativePosition { position });
            }
            inner.state.balance = balance;
            inner.state.position = position;
            inner.state.in_position = position * inner.state.entry_price;
            inner.state.total_balance = balance + inner.state.in_position;
            Ok(())
        })
    }

    pub fn pause_trading(&self, reason: String, now_ms: i64) -> Result<(), StateError> {
        self.mutate("pause_trading", Some(reason.clone()), now_ms, |inner| {
            inner.state.is_trading = false;
            inner.state.paused_at = Some(now_ms);
            inner.state.pause_reason = Some(reason.clone());
            Ok(())
        })
    }

    /// Pauses trading and engages `recoveryMode` without touching positions
    /// or active trades. This is the automatic critical-drift response
    /// (spec §4.6: "pauseTrading(reason), record, alert, mark recoveryMode
    /// (hard stop)") — distinct from [`Self::emergency_reset`], which also
    /// wipes the position/trade book and is reserved for the human-initiated
    /// operation spec §7 describes.
    pub fn mark_recovery_mode(&self, reason: String, now_ms: i64) -> Result<(), StateError> {
        self.mutate("mark_recovery_mode", Some(reason.clone()), now_ms, |inner| {
            inner.state.is_trading = false;
            inner.state.paused_at = Some(now_ms);
            inner.state.pause_reason = Some(reason.clone());
            inner.state.recovery_mode = true;
            Ok(())
        })
    }

    /// Resumes trading and clears `recoveryMode`. Per spec §9's resolution
    /// of the open question on `recoveryMode`'s exit path: this explicit
    /// operator call is the only way out of recovery, whether it was
    /// engaged by [`Self::emergency_reset`] or [`Self::mark_recovery_mode`].
    pub fn resume_trading(&self, now_ms: i64) -> Result<(), StateError> {
        self.mutate("resume_trading", None, now_ms, |inner| {
            inner.state.is_trading = true;
            inner.state.paused_at = None;
            inner.state.pause_reason = None;
            inner.state.recovery_mode = false;
            Ok(())
        })
    }

    pub fn is_trading(&self) -> bool {
        self.inner.lock().unwrap().state.is_trading
    }

    /// Asserts the §3 invariants and returns any issues found; does not
    /// mutate state.
    pub fn validate(&self) -> Vec<String> {
        self.inner.lock().unwrap().state.validate()
    }

    /// Wipes positions and active trades; optionally overrides balance;
    /// forces `recoveryMode = true`. Human-initiated, bypasses the
    /// mutation-rejection guards (spec §7: emergency operations "explicitly
    /// override guards").
    pub fn emergency_reset(&self, safe_balance: Option<Decimal>, now_ms: i64) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(balance) = safe_balance {
            guard.state.balance = balance;
            guard.state.total_balance = balance;
        }
        guard.state.position = Decimal::ZERO;
        guard.state.in_position = Decimal::ZERO;
        guard.state.entry_price = Decimal::ZERO;
        guard.state.active_trades.clear();
        guard.state.recovery_mode = true;
        guard.entry_time_ms = None;
        guard.state.last_update_ms = now_ms;
        drop(guard);
        if !self.mode.skips_persistence() {
            if let Err(e) = self.persist() {
                warn!("failed to persist state after emergency reset: {e}");
            }
        }
        warn!("emergency reset performed; recovery_mode engaged");
    }

    pub fn transaction_log(&self) -> Vec<TransactionLogEntry> {
        self.inner.lock().unwrap().log.iter().cloned().collect()
    }

    pub fn record_price(&self, price: Decimal) {
        self.inner.lock().unwrap().last_price = price;
    }
}
