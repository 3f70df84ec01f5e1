use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::error::KernelError;
use crate::trade_logger::TradeLogger;
use crate::types::{Bar, Fill, PortfolioSnapshot, Side, Signal};

/// Regulation-T-analog initial margin multiplier for short sales: opening a
/// short requires `1.5x` the notional as cash collateral.
pub const SHORT_MARGIN_MULTIPLIER: Decimal = Decimal::from_parts(15, 0, 0, false, 1);

/// Why a signal was rejected instead of producing a fill. Rejections are an
/// expected outcome of normal operation (the strategy asked for more than
/// the broker model allows), never an error.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectionReason {
    InsufficientCash { needed: Decimal, available: Decimal },
    DirectionCrossover { current_position: i64, requested_side: Side },
    OversoldFromLong { requested: i64, held: i64 },
    InsufficientShortCollateral { needed: Decimal, available: Decimal },
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::InsufficientCash { needed, available } => write!(
                f,
                "insufficient cash: needed {needed}, available {available}"
            ),
            RejectionReason::DirectionCrossover { current_position, requested_side } => write!(
                f,
                "order would flip position sign directly (current={current_position}, side={requested_side:?})"
            ),
            RejectionReason::OversoldFromLong { requested, held } => write!(
                f,
                "sell of {requested} shares exceeds current long position of {held}"
            ),
            RejectionReason::InsufficientShortCollateral { needed, available } => write!(
                f,
                "insufficient short collateral: needed {needed}, available {available}"
            ),
        }
    }
}

/// `execute_signal`'s failure channel. A rejection is an expected outcome of
/// normal operation (see [`RejectionReason`]); an invalid signal is a
/// malformed input from the strategy (e.g. `portfolio_percent` outside
/// `[0,1]`) and is fatal to the run, not something to log and continue past.
#[derive(Debug)]
pub enum ExecuteSignalError {
    Rejected(RejectionReason),
    InvalidSignal(KernelError),
}

impl std::fmt::Display for ExecuteSignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecuteSignalError::Rejected(reason) => write!(f, "{reason}"),
            ExecuteSignalError::InvalidSignal(err) => write!(f, "{err}"),
        }
    }
}

/// Owns cash, the position book, and the latest observed close per symbol.
/// `execute_signal` is the one method that mutates this state; every
/// mutation happens inside that single call so a caller never observes a
/// partially-applied fill.
pub struct Portfolio {
    cash: Decimal,
    positions: HashMap<String, i64>,
    latest_prices: HashMap<String, Decimal>,
    commission_per_share: Decimal,
    initial_capital: Decimal,
}

impl Portfolio {
    pub fn new(initial_capital: Decimal, commission_per_share: Decimal) -> Self {
        Self {
            cash: initial_capital,
            positions: HashMap::new(),
            latest_prices: HashMap::new(),
            commission_per_share,
            initial_capital,
        }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn positions(&self) -> &HashMap<String, i64> {
        &self.positions
    }

    pub fn position(&self, symbol: &str) -> i64 {
        self.positions.get(symbol).copied().unwrap_or(0)
    }

    pub fn latest_prices(&self) -> &HashMap<String, Decimal> {
        &self.latest_prices
    }

    /// Total portfolio value: `cash + sum(shares * latest_price)`.
    pub fn total_value(&self) -> Decimal {
        let positions_value: Decimal = self
            .positions
            .iter()
            .map(|(symbol, shares)| {
                let price = self.latest_prices.get(symbol).copied().unwrap_or(Decimal::ZERO);
                Decimal::from(*shares) * price
            })
            .sum();
        self.cash + positions_value
    }

    fn snapshot(&self) -> PortfolioSnapshot {
        let total_value = self.total_value();
        let mut allocations = HashMap::new();
        for (symbol, shares) in &self.positions {
            let price = self.latest_prices.get(symbol).copied().unwrap_or(Decimal::ZERO);
            let value = Decimal::from(*shares) * price;
            let pct = if total_value != Decimal::ZERO {
                value / total_value
            } else {
                Decimal::ZERO
            };
            allocations.insert(symbol.clone(), pct);
        }
        PortfolioSnapshot {
            total_value,
            cash: self.cash,
            allocations,
        }
    }

    /// Equivalent to `snapshot()`, exposed under the name used elsewhere for
    /// the equity-curve observable.
    pub fn mark_to_market(&self) -> PortfolioSnapshot {
        self.snapshot()
    }

    /// Set `latest_prices[symbol] = bar.close` for every bar observed on this
    /// tick. Must be called before any signal on the same tick is executed.
    /// Idempotent: calling it twice with the same bars yields the same
    /// `latest_prices` and `total_value()`.
    pub fn update_market_value(&mut self, bars_this_tick: &[&Bar]) {
        for bar in bars_this_tick {
            self.latest_prices.insert(bar.symbol.clone(), bar.close);
        }
    }

    /// Execute one signal against the current bar. Returns `Ok(Some(fill))`
    /// on success, `Ok(None)` for a logged no-op (zero-share sizing, or
    /// liquidation of an already-flat symbol), `Err(Rejected(reason))` for a
    /// rejected order (state unchanged), or `Err(InvalidSignal(_))` if the
    /// signal itself is malformed (state unchanged) — the latter is fatal to
    /// the run, unlike a rejection.
    pub fn execute_signal(
        &mut self,
        signal: &Signal,
        current_bar: &Bar,
        bar_number: u64,
        mut logger: Option<&mut TradeLogger>,
    ) -> Result<Option<Fill>, ExecuteSignalError> {
        if signal.portfolio_percent < Decimal::ZERO || signal.portfolio_percent > Decimal::ONE {
            return Err(ExecuteSignalError::InvalidSignal(KernelError::input_validation(format!(
                "signal for {} carries portfolio_percent {} outside [0,1]",
                signal.symbol, signal.portfolio_percent
            ))));
        }

        let before = self.snapshot();

        let price = match self.latest_prices.get(&signal.symbol).copied() {
            Some(p) => p,
            None => {
                debug!(
                    symbol = %signal.symbol,
                    "latest_prices has no entry for this symbol; falling back to current_bar.close \
                     (this path exists only for test harnesses that skip update_market_value)"
                );
                current_bar.close
            }
        };

        let current_position = self.position(&signal.symbol);

        let (direction, quantity) = if signal.is_liquidation() {
            match current_position.cmp(&0) {
                std::cmp::Ordering::Greater => (Side::Sell, current_position),
                std::cmp::Ordering::Less => (Side::Buy, current_position.unsigned_abs() as i64),
                std::cmp::Ordering::Equal => return Ok(None),
            }
        } else {
            let portfolio_value = before.total_value;
            let allocation_dollars = portfolio_value * signal.portfolio_percent;
            let shares = size_shares(
                allocation_dollars,
                price,
                self.commission_per_share,
                signal.side,
                signal.risk_per_share,
            );
            if shares <= 0 {
                debug!(symbol = %signal.symbol, "position sizing produced zero shares; no-op");
                return Ok(None);
            }
            (signal.side, shares)
        };

        self.validate_order(direction, quantity, price, current_position)
            .map_err(|reason| {
                warn!(
                    symbol = %signal.symbol,
                    ?direction,
                    quantity,
                    reason = %reason,
                    "signal rejected by trading constraints"
                );
                ExecuteSignalError::Rejected(reason)
            })?;

        let commission = Decimal::from(quantity) * self.commission_per_share;
        let notional = Decimal::from(quantity) * price;
        match direction {
            Side::Buy => self.cash -= notional + commission,
            Side::Sell => self.cash += notional - commission,
        }

        let delta = match direction {
            Side::Buy => quantity,
            Side::Sell => -quantity,
        };
        let new_position = current_position + delta;
        if new_position == 0 {
            self.positions.remove(&signal.symbol);
        } else {
            self.positions.insert(signal.symbol.clone(), new_position);
        }

        let fill = Fill {
            symbol: signal.symbol.clone(),
            direction,
            quantity,
            fill_price: price,
            commission,
            timestamp: current_bar.timestamp,
        };

        let after = self.snapshot();
        if let Some(logger) = logger.as_deref_mut() {
            logger.log_trade_execution(fill.clone(), bar_number, before, after, self.initial_capital);
        }

        Ok(Some(fill))
    }

    /// The five ordered constraint checks of the trading-constraint policy.
    fn validate_order(
        &self,
        direction: Side,
        quantity: i64,
        price: Decimal,
        current_position: i64,
    ) -> Result<(), RejectionReason> {
        let commission = Decimal::from(quantity) * self.commission_per_share;
        let notional = Decimal::from(quantity) * price;

        // 1. Cash for a BUY.
        if direction == Side::Buy {
            let needed = notional + commission;
            if needed > self.cash {
                return Err(RejectionReason::InsufficientCash {
                    needed,
                    available: self.cash,
                });
            }
        }

        // 2. No direct LONG<->SHORT crossover.
        let delta = match direction {
            Side::Buy => quantity,
            Side::Sell => -quantity,
        };
        let new_position = current_position + delta;
        if current_position != 0 && new_position != 0 && current_position.signum() != new_position.signum() {
            return Err(RejectionReason::DirectionCrossover {
                current_position,
                requested_side: direction,
            });
        }

        // 3. SELL while LONG: cannot sell more than is held.
        if direction == Side::Sell && current_position > 0 && quantity > current_position {
            return Err(RejectionReason::OversoldFromLong {
                requested: quantity,
                held: current_position,
            });
        }

        // 4 & 5. SELL while FLAT (opening a short) or SELL while SHORT
        // (adding to it): the same collateral formula applies to the
        // incremental shares in both cases.
        if direction == Side::Sell && current_position <= 0 {
            let needed = notional * SHORT_MARGIN_MULTIPLIER + commission;
            if needed > self.cash {
                return Err(RejectionReason::InsufficientShortCollateral {
                    needed,
                    available: self.cash,
                });
            }
        }

        Ok(())
    }
}

/// Translate allocation dollars into an integer share count.
///
/// `risk_per_share`, when set on the signal, overrides both formulas below:
/// `shares = floor(allocation_dollars / risk_per_share)`. This lets a
/// strategy size by a volatility stop distance; the portfolio still enforces
/// cash/margin constraints on the result afterward.
pub fn size_shares(
    allocation_dollars: Decimal,
    price: Decimal,
    commission_per_share: Decimal,
    side: Side,
    risk_per_share: Option<Decimal>,
) -> i64 {
    if allocation_dollars <= Decimal::ZERO || price <= Decimal::ZERO {
        return 0;
    }
    let raw = if let Some(r) = risk_per_share {
        if r <= Decimal::ZERO {
            return 0;
        }
        (allocation_dollars / r).floor()
    } else {
        match side {
            Side::Buy => (allocation_dollars / (price + commission_per_share)).floor(),
            Side::Sell => {
                (allocation_dollars / (price * SHORT_MARGIN_MULTIPLIER + commission_per_share)).floor()
            }
        }
    };
    if raw <= Decimal::ZERO {
        0
    } else {
        raw.to_i64().unwrap_or(i64::MAX)
    }
}

/// Compute a closing order's `(direction, quantity)` for the liquidation
/// idiom, exposed standalone so callers (e.g. tests) can predict the order a
/// `buy(sym, 0.0)`/`sell(sym, 0.0)` signal will produce without replaying the
/// whole engine.
pub fn closing_order(current_position: i64) -> Option<(Side, i64)> {
    match current_position.cmp(&0) {
        std::cmp::Ordering::Greater => Some((Side::Sell, current_position)),
        std::cmp::Ordering::Less => Some((Side::Buy, current_position.unsigned_abs() as i64)),
        std::cmp::Ordering::Equal => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn d(i: i64) -> Decimal {
        Decimal::from(i)
    }

    fn cents(whole: i64, cents: i64) -> Decimal {
        Decimal::new(whole * 100 + cents, 2)
    }

    fn bar(symbol: &str, ts: &str, close: i64) -> Bar {
        let c = d(close);
        Bar {
            symbol: symbol.to_string(),
            timestamp: ts.parse::<DateTime<Utc>>().unwrap(),
            open: c,
            high: c,
            low: c,
            close: c,
            volume: d(1000),
        }
    }

    #[test]
    fn long_entry_then_liquidation_scenario() {
        // Two bars of X, close 100 then 110: buy, then liquidate.
        let mut pf = Portfolio::new(cents(1000, 0), Decimal::new(1, 2));
        let b1 = bar("X", "2024-01-01T00:00:00Z", 100);
        pf.update_market_value(&[&b1]);

        let sig = Signal::new("X", Side::Buy, b1.timestamp, Decimal::ONE);
        let fill = pf.execute_signal(&sig, &b1, 1, None).unwrap().unwrap();
        assert_eq!(fill.quantity, 9);
        assert_eq!(fill.commission, Decimal::new(9, 2));
        assert_eq!(pf.cash(), Decimal::new(9991, 2));

        let b2 = bar("X", "2024-01-02T00:00:00Z", 110);
        pf.update_market_value(&[&b2]);
        let sig2 = Signal::new("X", Side::Sell, b2.timestamp, Decimal::ZERO);
        let fill2 = pf.execute_signal(&sig2, &b2, 2, None).unwrap().unwrap();
        assert_eq!(fill2.quantity, 9);
        assert_eq!(pf.cash(), Decimal::new(108982, 2));
        assert_eq!(pf.position("X"), 0);
    }

    #[test]
    fn illegal_long_to_short_crossover_is_rejected() {
        let mut pf = Portfolio::new(cents(100000, 0), Decimal::ZERO);
        let b = bar("X", "2024-01-01T00:00:00Z", 100);
        pf.update_market_value(&[&b]);
        // Force a long position directly for the test setup.
        let buy = Signal::new("X", Side::Buy, b.timestamp, Decimal::new(1, 2));
        pf.execute_signal(&buy, &b, 1, None).unwrap();
        assert_eq!(pf.position("X"), 10);

        let sell_all = Signal::new("X", Side::Sell, b.timestamp, Decimal::ONE);
        let result = pf.execute_signal(&sell_all, &b, 2, None);
        assert!(matches!(result, Err(ExecuteSignalError::Rejected(RejectionReason::DirectionCrossover { .. }))));
        assert_eq!(pf.position("X"), 10);
    }

    #[test]
    fn short_initial_margin_enforced() {
        let mut pf = Portfolio::new(cents(10000, 0), Decimal::new(1, 2));
        let b = bar("X", "2024-01-01T00:00:00Z", 150);
        pf.update_market_value(&[&b]);

        let sig = Signal::new("X", Side::Sell, b.timestamp, Decimal::new(8, 1));
        let fill = pf.execute_signal(&sig, &b, 1, None).unwrap().unwrap();
        assert_eq!(fill.quantity, 35);
        assert!(pf.cash() > Decimal::ZERO);
    }

    #[test]
    fn sizing_floors_to_whatever_cash_actually_affords() {
        // 9 shares at $10 costs exactly $90; a $99 allocation can still only
        // afford 9 (floor), never a fractional 9.9.
        let price = d(10);
        let mut pf = Portfolio::new(Decimal::new(9900, 2), Decimal::ZERO);
        let b = bar("X", "2024-01-01T00:00:00Z", 10);
        pf.update_market_value(&[&b]);
        let sig = Signal::new("X", Side::Buy, b.timestamp, Decimal::ONE);
        let fill = pf.execute_signal(&sig, &b, 1, None).unwrap().unwrap();
        assert_eq!(fill.quantity, 9);
        assert_eq!(fill.fill_price, price);
    }

    #[test]
    fn insufficient_cash_for_a_forced_buy_is_rejected() {
        let price = d(10);
        let mut pf = Portfolio::new(price * d(10), Decimal::ZERO);
        let b = bar("X", "2024-01-01T00:00:00Z", 10);
        pf.update_market_value(&[&b]);
        // risk_per_share overrides sizing to request exactly 11 shares,
        // one more than the ten shares the $100 of cash affords.
        let mut sig = Signal::new("X", Side::Buy, b.timestamp, Decimal::ONE);
        sig.risk_per_share = Some(price * d(10) / d(11));
        let result = pf.execute_signal(&sig, &b, 1, None);
        assert!(matches!(result, Err(ExecuteSignalError::Rejected(RejectionReason::InsufficientCash { .. }))));
    }

    #[test]
    fn idempotent_update_market_value() {
        let mut pf = Portfolio::new(d(1000), Decimal::ZERO);
        let b = bar("X", "2024-01-01T00:00:00Z", 50);
        pf.update_market_value(&[&b]);
        let first = pf.total_value();
        pf.update_market_value(&[&b]);
        let second = pf.total_value();
        assert_eq!(first, second);
        assert_eq!(pf.latest_prices().get("X").copied(), Some(d(50)));
    }

    #[test]
    fn liquidation_is_noop_when_already_flat() {
        let mut pf = Portfolio::new(d(1000), Decimal::ZERO);
        let b = bar("X", "2024-01-01T00:00:00Z", 50);
        pf.update_market_value(&[&b]);
        let sig = Signal::new("X", Side::Buy, b.timestamp, Decimal::ZERO);
        let result = pf.execute_signal(&sig, &b, 1, None).unwrap();
        assert!(result.is_none());
        assert_eq!(pf.cash(), d(1000));
    }

    #[test]
    fn portfolio_percent_above_one_is_a_fatal_invalid_signal_not_a_rejection() {
        let mut pf = Portfolio::new(d(1000), Decimal::ZERO);
        let b = bar("X", "2024-01-01T00:00:00Z", 50);
        pf.update_market_value(&[&b]);
        let sig = Signal::new("X", Side::Buy, b.timestamp, Decimal::new(15, 1)); // 1.5
        let result = pf.execute_signal(&sig, &b, 1, None);
        assert!(matches!(
            result,
            Err(ExecuteSignalError::InvalidSignal(KernelError::InputValidation(_)))
        ));
        // State must be untouched: a fatal input error isn't a partial fill.
        assert_eq!(pf.cash(), d(1000));
    }

    #[test]
    fn negative_portfolio_percent_is_a_fatal_invalid_signal_not_a_silent_noop() {
        let mut pf = Portfolio::new(d(1000), Decimal::ZERO);
        let b = bar("X", "2024-01-01T00:00:00Z", 50);
        pf.update_market_value(&[&b]);
        let sig = Signal::new("X", Side::Sell, b.timestamp, Decimal::new(-1, 1)); // -0.1
        let result = pf.execute_signal(&sig, &b, 1, None);
        assert!(matches!(
            result,
            Err(ExecuteSignalError::InvalidSignal(KernelError::InputValidation(_)))
        ));
    }
}
