//! Position state machine and capital ledger
//!
//! `none → active → closing → closed → none`. The manager enforces the entry
//! invariants (at most three entries, strictly increasing time and rank,
//! allocation total ≤ 1) and keeps the capital ledger in step with every
//! transition.

use crate::error::PositionError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use types::{
    Entry, EntryType, ExitDetails, ExitReason, OrderFill, Position, PositionId, PositionStatus,
    ProfitReport, TimestampMs,
};

/// Per-instance capital bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapitalLedger {
    pub available: Decimal,
    pub locked: Decimal,
    pub realized_profit: Decimal,
}

impl CapitalLedger {
    pub fn new(initial_capital: Decimal) -> Self {
        Self {
            available: initial_capital,
            locked: Decimal::ZERO,
            realized_profit: Decimal::ZERO,
        }
    }

    pub fn lock(&mut self, amount: Decimal) {
        self.available -= amount;
        self.locked += amount;
    }

    pub fn unlock(&mut self, amount: Decimal) {
        self.available += amount;
        self.locked -= amount;
    }

    /// Release the invested capital and book the close proceeds
    pub fn settle(&mut self, invested: Decimal, exit_quote: Decimal) {
        self.locked -= invested;
        self.available += exit_quote;
        self.realized_profit += exit_quote - invested;
    }

    /// Release capital locked without an open position; returns the amount freed
    pub fn heal(&mut self, has_open_position: bool) -> Option<Decimal> {
        if has_open_position || self.locked <= Decimal::ZERO {
            return None;
        }
        let released = self.locked;
        self.available += released;
        self.locked = Decimal::ZERO;
        Some(released)
    }
}

/// Entry removed by a broker rejection
#[derive(Debug, Clone, PartialEq)]
pub struct RolledBack {
    pub entry: Entry,
    /// The position had no other entries and was discarded
    pub position_discarded: bool,
}

/// A completed close, ready to archive
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPosition {
    pub position: Position,
    pub details: ExitDetails,
}

#[derive(Debug, Clone)]
pub struct PositionManager {
    symbol: String,
    position: Option<Position>,
    ledger: CapitalLedger,
}

impl PositionManager {
    pub fn new(symbol: impl Into<String>, initial_capital: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            position: None,
            ledger: CapitalLedger::new(initial_capital),
        }
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn position_mut(&mut self) -> Option<&mut Position> {
        self.position.as_mut()
    }

    pub fn status(&self) -> PositionStatus {
        self.position
            .as_ref()
            .map(|p| p.status)
            .unwrap_or(PositionStatus::None)
    }

    pub fn ledger(&self) -> &CapitalLedger {
        &self.ledger
    }

    /// Rehydrate from persistence; only `active` and `closing` positions are open
    pub fn restore(&mut self, position: Option<Position>, ledger: Option<CapitalLedger>) {
        if let Some(ledger) = ledger {
            self.ledger = ledger;
        }
        self.position = position.filter(|p| {
            matches!(p.status, PositionStatus::Active | PositionStatus::Closing)
        });
    }

    /// Heal a ledger that has capital locked without an open position
    pub fn heal_ledger(&mut self) -> Option<Decimal> {
        let has_open = self.position.is_some();
        self.ledger.heal(has_open)
    }

    /// Apply an accepted entry, opening the position on `first`
    pub fn apply_entry(&mut self, entry: Entry) -> Result<&Position, PositionError> {
        if self.position.is_none() {
            if entry.entry_type != EntryType::First {
                return Err(PositionError::EntryOutOfOrder {
                    expected: Some(EntryType::First),
                    got: entry.entry_type,
                });
            }
            check_allocation(Decimal::ZERO, entry.allocation_fraction)?;
            self.ledger.lock(entry.quote_amount);
            let position = Position::open(PositionId::generate(), self.symbol.clone(), entry);
            return Ok(&*self.position.insert(position));
        }

        let position = self.position.as_mut().ok_or(PositionError::NoActivePosition)?;
        if position.status != PositionStatus::Active {
            return Err(PositionError::UnexpectedStatus {
                status: position.status,
                expected: PositionStatus::Active,
            });
        }
        let expected = position.next_entry_type();
        if expected != Some(entry.entry_type) {
            return Err(PositionError::EntryOutOfOrder {
                expected,
                got: entry.entry_type,
            });
        }
        if entry.time <= position.last_entry_time {
            return Err(PositionError::NonMonotonicEntry {
                time: entry.time,
                last: position.last_entry_time,
            });
        }
        check_allocation(position.allocation_total(), entry.allocation_fraction)?;

        self.ledger.lock(entry.quote_amount);
        position.entries.push(entry);
        position.recompute_totals();
        position.mid_reclaimed = false;
        Ok(&*position)
    }

    /// Replace the optimistic amounts of an entry with the broker fill
    pub fn confirm_entry(
        &mut self,
        position_id: PositionId,
        entry_type: EntryType,
        fill: &OrderFill,
    ) -> Result<&Position, PositionError> {
        let position = self.open_position_mut(position_id)?;
        let Some(entry) = position
            .entries
            .iter_mut()
            .find(|e| e.entry_type == entry_type)
        else {
            return Err(PositionError::EntryOutOfOrder {
                expected: None,
                got: entry_type,
            });
        };

        let delta = fill.filled_quote - entry.quote_amount;
        entry.quote_amount = fill.filled_quote;
        entry.base_amount = fill.filled_base;
        entry.price = fill.avg_fill_price;
        position.recompute_totals();
        self.ledger.lock(delta);

        self.open_position(position_id)
    }

    /// Undo an entry the broker refused
    pub fn rollback_entry(
        &mut self,
        position_id: PositionId,
        entry_type: EntryType,
    ) -> Result<RolledBack, PositionError> {
        let position = self.open_position_mut(position_id)?;
        if position.status != PositionStatus::Active {
            return Err(PositionError::UnexpectedStatus {
                status: position.status,
                expected: PositionStatus::Active,
            });
        }
        match position.entries.last() {
            Some(last) if last.entry_type == entry_type => {}
            _ => {
                return Err(PositionError::EntryOutOfOrder {
                    expected: position.entries.last().map(|e| e.entry_type),
                    got: entry_type,
                })
            }
        }

        let Some(entry) = position.entries.pop() else {
            return Err(PositionError::NoActivePosition);
        };
        let position_discarded = position.entries.is_empty();
        if position_discarded {
            self.position = None;
        } else {
            position.recompute_totals();
        }
        self.ledger.unlock(entry.quote_amount);

        Ok(RolledBack {
            entry,
            position_discarded,
        })
    }

    /// `active → closing`
    pub fn begin_close(
        &mut self,
        reason: ExitReason,
        now: TimestampMs,
    ) -> Result<&Position, PositionError> {
        let position = self.position.as_mut().ok_or(PositionError::NoActivePosition)?;
        if position.status != PositionStatus::Active {
            return Err(PositionError::UnexpectedStatus {
                status: position.status,
                expected: PositionStatus::Active,
            });
        }
        position.status = PositionStatus::Closing;
        position.closing_since = Some(now);
        position.exit_reason = Some(reason);
        position.peak_price_since_armed = None;
        position.trailing_armed_at = None;
        Ok(&*position)
    }

    /// `closing → closed → none`, settling the ledger from the fill
    pub fn complete_close(
        &mut self,
        position_id: PositionId,
        fill: &OrderFill,
        now: TimestampMs,
    ) -> Result<ClosedPosition, PositionError> {
        let position = self.open_position_mut(position_id)?;
        if position.status != PositionStatus::Closing {
            return Err(PositionError::UnexpectedStatus {
                status: position.status,
                expected: PositionStatus::Closing,
            });
        }

        let invested = position.total_quote;
        let report = ProfitReport::compute(fill.filled_quote, invested);
        position.status = PositionStatus::Closed;
        let details = ExitDetails {
            exit_time: now,
            exit_price: fill.avg_fill_price,
            exit_quote: fill.filled_quote,
            exit_base: fill.filled_base,
            reason: position.exit_reason.unwrap_or(ExitReason::Manual),
            profit: report.profit,
            profit_percent: report.profit_percent,
            order_id: Some(fill.order_id.clone()),
        };

        self.ledger.settle(invested, fill.filled_quote);
        let Some(position) = self.position.take() else {
            return Err(PositionError::NoActivePosition);
        };
        Ok(ClosedPosition { position, details })
    }

    /// Drop armed trailing-stop state, e.g. when the instance stops
    pub fn disarm_trailing(&mut self) {
        if let Some(position) = self.position.as_mut() {
            position.peak_price_since_armed = None;
            position.trailing_armed_at = None;
        }
    }

    fn open_position(&self, position_id: PositionId) -> Result<&Position, PositionError> {
        match self.position.as_ref() {
            Some(p) if p.position_id == position_id => Ok(p),
            Some(_) => Err(PositionError::UnknownPosition(position_id)),
            None => Err(PositionError::NoActivePosition),
        }
    }

    fn open_position_mut(&mut self, position_id: PositionId) -> Result<&mut Position, PositionError> {
        match self.position.as_mut() {
            Some(p) if p.position_id == position_id => Ok(p),
            Some(_) => Err(PositionError::UnknownPosition(position_id)),
            None => Err(PositionError::NoActivePosition),
        }
    }
}

fn check_allocation(current: Decimal, added: Decimal) -> Result<(), PositionError> {
    let total = current + added;
    if total > Decimal::ONE {
        return Err(PositionError::AllocationExceeded { total });
    }
    Ok(())
}
