//! Mirrored account state driven by portfolio and balance events.

use crate::domain::{BlitzOptionConfig, CloseReason, Position, PositionId, PositionStatus};
use crate::env::types::StateSnapshot;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// What one position event did to the state.
#[derive(Debug)]
pub enum PositionTransition {
    /// The position was added to or updated in the open set.
    Opened,
    /// The position left the open set; counters were bumped exactly once.
    Closed(Position),
    /// Duplicate or stale event, state untouched.
    Ignored,
}

#[derive(Default)]
struct Inner {
    balance: Decimal,
    open: HashMap<PositionId, Position>,
    // Ids that already closed, so duplicate close events and late open
    // events cannot double-count. Grows by one entry per settled trade and
    // is never pruned: the rate limit caps settlements at one per
    // expiration window, a few thousand entries per day of runtime.
    closed_ids: HashSet<PositionId>,
    closed_count: u64,
    win_count: u64,
    loss_count: u64,
    total_pnl: Decimal,
    assets: Vec<BlitzOptionConfig>,
    server_time: u64,
}

/// Shared mutable environment state. All access goes through short lock
/// sections; nothing is held across await points.
#[derive(Default)]
pub struct EnvironmentState {
    inner: Mutex<Inner>,
}

impl EnvironmentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.inner.lock().unwrap().balance = balance;
    }

    pub fn set_assets(&self, assets: Vec<BlitzOptionConfig>) {
        self.inner.lock().unwrap().assets = assets;
    }

    pub fn assets(&self) -> Vec<BlitzOptionConfig> {
        self.inner.lock().unwrap().assets.clone()
    }

    pub fn set_server_time(&self, server_time: u64) {
        self.inner.lock().unwrap().server_time = server_time;
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().unwrap().open.len()
    }

    /// Fold one position event into the state.
    ///
    /// Open events upsert the open set unless the id already closed. Close
    /// events settle the id exactly once: the first one bumps the counters
    /// and the realized PnL, duplicates are ignored.
    pub fn apply_position(&self, position: &Position) -> PositionTransition {
        let mut inner = self.inner.lock().unwrap();

        if inner.closed_ids.contains(&position.id) {
            return PositionTransition::Ignored;
        }

        match position.status {
            PositionStatus::Open => {
                inner.open.insert(position.id.clone(), position.clone());
                PositionTransition::Opened
            }
            PositionStatus::Closed => {
                inner.open.remove(&position.id);
                inner.closed_ids.insert(position.id.clone());
                inner.closed_count += 1;
                inner.total_pnl += position.pnl;
                match position.close_reason {
                    Some(CloseReason::Win) => inner.win_count += 1,
                    _ => inner.loss_count += 1,
                }
                PositionTransition::Closed(position.clone())
            }
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.lock().unwrap();
        StateSnapshot {
            balance: inner.balance,
            open_positions: inner.open.values().cloned().collect(),
            closed_count: inner.closed_count,
            win_count: inner.win_count,
            loss_count: inner.loss_count,
            total_pnl: inner.total_pnl,
            available_assets: inner.assets.clone(),
            server_time: inner.server_time,
        }
    }
}
