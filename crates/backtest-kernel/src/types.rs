use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// Trade direction. `Side::Buy` opens or enlarges a long; `Side::Sell` opens
/// or enlarges a short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// A single OHLCV observation for one symbol at a tz-aware UTC timestamp.
///
/// Invariants (enforced by [`Bar::validate`]): `low <= min(open, close) <=
/// max(open, close) <= high`; `volume >= 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    pub fn validate(&self) -> Result<(), KernelError> {
        let body_lo = self.open.min(self.close);
        let body_hi = self.open.max(self.close);
        if !(self.low <= body_lo && body_hi <= self.high) {
            return Err(KernelError::input_validation(format!(
                "bar for {} at {} violates OHLC invariant: low={} open={} close={} high={}",
                self.symbol, self.timestamp, self.low, self.open, self.close, self.high
            )));
        }
        if self.volume < Decimal::ZERO {
            return Err(KernelError::input_validation(format!(
                "bar for {} at {} has negative volume {}",
                self.symbol, self.timestamp, self.volume
            )));
        }
        Ok(())
    }
}

/// Emitted by a strategy: "allocate this fraction of current total portfolio
/// value to a position in this direction on this symbol". `portfolio_percent
/// == 0` is the universal liquidation idiom regardless of `side`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
    pub portfolio_percent: Decimal,
    /// ATR-risk sizing override: if set, shares are sized as
    /// `floor(allocation_dollars / risk_per_share)` instead of the default
    /// price-based formula. See `portfolio::size_shares`.
    #[serde(default)]
    pub risk_per_share: Option<Decimal>,
}

impl Signal {
    pub fn new(symbol: impl Into<String>, side: Side, timestamp: DateTime<Utc>, portfolio_percent: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            timestamp,
            portfolio_percent,
            risk_per_share: None,
        }
    }

    pub fn is_liquidation(&self) -> bool {
        self.portfolio_percent.is_zero()
    }
}

/// Internal market order produced by the portfolio from a signal. Market
/// orders only; no limit/stop order types exist in this kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub symbol: String,
    pub direction: Side,
    pub quantity: i64,
    pub timestamp: DateTime<Utc>,
}

/// Produced on successful order execution. Fills are append-only; none is
/// ever mutated once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub symbol: String,
    pub direction: Side,
    pub quantity: i64,
    pub fill_price: Decimal,
    pub commission: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// A snapshot of portfolio totals captured before or after a signal is
/// executed, used both for trade-log rows and for equity-curve points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub total_value: Decimal,
    pub cash: Decimal,
    /// Allocation percentage per symbol: `shares * price / total_value`.
    pub allocations: HashMap<String, Decimal>,
}

/// Captured by a strategy *before* emitting a signal, via
/// `log_strategy_context`. `symbol` must be the trade symbol the upcoming
/// signal will target, not the signal asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyContextRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub bar_number: u64,
    pub state_label: String,
    pub decision_reason: String,
    pub indicators: HashMap<String, Decimal>,
    pub thresholds: HashMap<String, Decimal>,
}

/// A joined record of one fill with its matching strategy context (if any),
/// augmented with before/after portfolio snapshots and cumulative return.
/// Trade records are append-only and globally numbered by `trade_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: u64,
    pub fill: Fill,
    pub bar_number: u64,
    pub state_label: String,
    pub decision_reason: String,
    pub indicators: HashMap<String, Decimal>,
    pub thresholds: HashMap<String, Decimal>,
    pub before: PortfolioSnapshot,
    pub after: PortfolioSnapshot,
    /// Cumulative return since the start of the run, measured against
    /// `after.total_value` vs. the run's initial capital.
    pub cumulative_return_pct: Decimal,
}

pub const UNKNOWN_STATE_LABEL: &str = "Unknown";

/// One point on the equity curve: `(timestamp, total_portfolio_value)`,
/// recorded once per bar after all that bar's fills are applied.
///
/// `cash`/`positions`/`latest_prices` are carried alongside the headline
/// `total_value` so the portfolio-daily CSV (§6) can render per-ticker
/// quantity/value columns and a baseline comparison without the analyzer
/// needing to replay the fill log; the analyzer itself only ever reads
/// `timestamp`/`total_value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub total_value: Decimal,
    pub cash: Decimal,
    pub positions: HashMap<String, i64>,
    pub latest_prices: HashMap<String, Decimal>,
}

impl EquityPoint {
    /// Build a bare point carrying only `timestamp`/`total_value`, for
    /// synthetic curves (e.g. a buy-and-hold baseline) that have no real
    /// portfolio behind them.
    pub fn bare(timestamp: DateTime<Utc>, total_value: Decimal) -> Self {
        Self {
            timestamp,
            total_value,
            cash: Decimal::ZERO,
            positions: HashMap::new(),
            latest_prices: HashMap::new(),
        }
    }
}
