use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::warn;

use crate::extended_analytics::ExtendedAnalytics;
use crate::types::{Bar, EquityPoint, Fill, Side, TradeRecord};

/// Tunables for `PerformanceAnalyzer::compute`. `periods_per_year` replaces a
/// hardcoded trading-days constant: daily bars use `252`, weekly `52`,
/// monthly `12`, and a caller backtesting a different asset class (e.g.
/// crypto, which trades every day of the year) can pass `365`.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub periods_per_year: u32,
    pub risk_free_rate_annual: Decimal,
    /// Off by default. When set, `ExtendedAnalytics` is computed alongside
    /// the core report; this is meaningfully more work (drawdown-event
    /// tables, monthly return grids, streak distributions) that most callers
    /// of a single backtest don't need.
    pub extended_analytics: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            periods_per_year: 252,
            risk_free_rate_annual: Decimal::ZERO,
            extended_analytics: false,
        }
    }
}

/// One closed round trip, reconstructed from the fill stream by matching
/// opening and closing lots FIFO, per symbol.
#[derive(Debug, Clone)]
pub struct RealizedTrade {
    pub symbol: String,
    pub entry_side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: i64,
    pub pnl: Decimal,
    pub entry_bar_number: u64,
    pub exit_bar_number: u64,
}

impl RealizedTrade {
    pub fn is_win(&self) -> bool {
        self.pnl > Decimal::ZERO
    }
}

#[derive(Debug, Clone, Default)]
pub struct TradeStats {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate_pct: f64,
    pub average_win: Decimal,
    pub average_loss: Decimal,
    pub profit_factor: f64,
}

#[derive(Debug, Clone)]
pub struct BaselineComparison {
    pub buy_and_hold_return_pct: f64,
    pub buy_and_hold_annualized_return_pct: Option<f64>,
    /// `strategy_return / baseline_return`, per §4.6 — a ratio, not the
    /// statistical alpha of CAPM (see the glossary entry "Alpha (here)").
    /// `None` ("N/A") when the baseline's own return is zero, since the
    /// ratio is undefined at that point.
    pub alpha: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct PerformanceReport {
    pub total_return_pct: f64,
    /// `(final/initial)^(365.25/days) - 1`, `None` when the run's first and
    /// last equity points share a timestamp (zero elapsed days) or the run
    /// lost all capital (a non-positive growth factor has no real root).
    pub annualized_return_pct: Option<f64>,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: Option<f64>,
    pub trade_stats: TradeStats,
    pub baseline: Option<BaselineComparison>,
    pub extended: Option<ExtendedAnalytics>,
}

/// Computes return, drawdown, Sharpe, and round-trip trade statistics from
/// an equity curve and a fill stream.
///
/// Ratios and percentages here are `f64`, unlike the `Decimal` ledger
/// (`Portfolio`, `Fill`, `TradeRecord`): a Sharpe ratio is a statistical
/// estimate built from a mean and a standard deviation, not a monetary
/// amount that must reconcile to the cent, so there is no precision
/// obligation to carry it in fixed-point.
pub struct PerformanceAnalyzer;

impl PerformanceAnalyzer {
    pub fn compute(
        equity_curve: &[EquityPoint],
        trades: &[TradeRecord],
        initial_capital: Decimal,
        baseline_bars: Option<&[Bar]>,
        config: &AnalyzerConfig,
    ) -> PerformanceReport {
        let total_return_pct = match equity_curve.last() {
            Some(last) => to_f64_ratio(last.total_value, initial_capital) * 100.0,
            None => 0.0,
        };

        let annualized_return_pct = match (equity_curve.first(), equity_curve.last()) {
            (Some(first), Some(last)) => {
                annualize(total_return_pct / 100.0, first.timestamp, last.timestamp)
            }
            _ => None,
        };

        let max_drawdown_pct = max_drawdown(equity_curve);
        let sharpe_ratio = sharpe_ratio(equity_curve, config);
        let realized = reconstruct_round_trips(trades);
        let trade_stats = trade_stats(&realized);

        let baseline = baseline_bars.and_then(|bars| {
            let buy_and_hold_return_pct = buy_and_hold_return(bars)?;
            let buy_and_hold_annualized_return_pct = match (bars.first(), bars.last()) {
                (Some(first), Some(last)) => {
                    annualize(buy_and_hold_return_pct / 100.0, first.timestamp, last.timestamp)
                }
                _ => None,
            };
            let alpha = if buy_and_hold_return_pct == 0.0 {
                None
            } else {
                Some(total_return_pct / buy_and_hold_return_pct)
            };
            Some(BaselineComparison {
                buy_and_hold_return_pct,
                buy_and_hold_annualized_return_pct,
                alpha,
            })
        });

        let extended = config
            .extended_analytics
            .then(|| crate::extended_analytics::compute(equity_curve, &realized, config.periods_per_year));

        PerformanceReport {
            total_return_pct,
            annualized_return_pct,
            max_drawdown_pct,
            sharpe_ratio,
            trade_stats,
            baseline,
            extended,
        }
    }
}

/// `(1 + total_return)^(365.25/days) - 1`, expressed as a percentage.
/// `days` is the fractional elapsed time between the run's first and last
/// observed point; `None` when that span is zero (a single-point curve) or
/// the growth factor is non-positive (total loss has no real annualized
/// root).
fn annualize(total_return_fraction: f64, first: chrono::DateTime<chrono::Utc>, last: chrono::DateTime<chrono::Utc>) -> Option<f64> {
    let days = (last - first).num_milliseconds() as f64 / 86_400_000.0;
    if days <= 0.0 {
        return None;
    }
    let growth = 1.0 + total_return_fraction;
    if growth <= 0.0 {
        return None;
    }
    Some((growth.powf(365.25 / days) - 1.0) * 100.0)
}

fn to_f64_ratio(numerator: Decimal, denominator: Decimal) -> f64 {
    if denominator.is_zero() {
        return 0.0;
    }
    ((numerator - denominator) / denominator).to_f64().unwrap_or(0.0)
}

/// Maximum peak-to-trough drawdown, expressed as a negative percentage.
/// Clamped to `(-100.0, 0.0]`: a peak of exactly zero (only possible if the
/// run starts at zero capital) would otherwise divide by zero.
fn max_drawdown(equity_curve: &[EquityPoint]) -> f64 {
    let mut peak = Decimal::ZERO;
    let mut worst = 0.0f64;
    for point in equity_curve {
        if point.total_value > peak {
            peak = point.total_value;
        }
        if peak.is_zero() {
            warn!("equity peak is zero; skipping drawdown sample to avoid division by zero");
            continue;
        }
        let dd = ((point.total_value - peak) / peak).to_f64().unwrap_or(0.0) * 100.0;
        if dd < worst {
            worst = dd;
        }
    }
    worst.clamp(-100.0, 0.0)
}

fn sharpe_ratio(equity_curve: &[EquityPoint], config: &AnalyzerConfig) -> Option<f64> {
    if equity_curve.len() < 2 {
        return None;
    }
    let returns: Vec<f64> = equity_curve
        .windows(2)
        .filter_map(|w| {
            if w[0].total_value.is_zero() {
                None
            } else {
                ((w[1].total_value - w[0].total_value) / w[0].total_value).to_f64()
            }
        })
        .collect();
    if returns.len() < 2 {
        return None;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    let stdev = variance.sqrt();
    if stdev == 0.0 {
        warn!("return series has zero variance; Sharpe ratio is undefined");
        return None;
    }

    let periods_per_year = config.periods_per_year as f64;
    let risk_free_per_period = config.risk_free_rate_annual.to_f64().unwrap_or(0.0) / periods_per_year;
    Some((mean - risk_free_per_period) / stdev * periods_per_year.sqrt())
}

fn buy_and_hold_return(bars: &[Bar]) -> Option<f64> {
    let first = bars.first()?;
    let last = bars.last()?;
    if first.close.is_zero() {
        return None;
    }
    (((last.close - first.close) / first.close) * Decimal::from(100)).to_f64()
}

/// Walk the fill stream per symbol with a FIFO lot queue, realizing P&L each
/// time a fill reduces or reverses an open lot. Mirrors how a broker
/// statement computes round-trip trades from a raw execution log.
pub(crate) fn reconstruct_round_trips(trades: &[TradeRecord]) -> Vec<RealizedTrade> {
    struct Lot {
        side: Side,
        quantity: i64,
        price: Decimal,
        bar_number: u64,
    }

    let mut open_lots: HashMap<String, Vec<Lot>> = HashMap::new();
    let mut realized = Vec::new();

    for trade in trades {
        let fill: &Fill = &trade.fill;
        let lots = open_lots.entry(fill.symbol.clone()).or_default();
        let mut remaining = fill.quantity;

        while remaining > 0 {
            let Some(front) = lots.first_mut() else { break };
            if front.side == fill.direction {
                break; // same-direction fill opens/adds a lot, doesn't close one
            }
            let closed_qty = remaining.min(front.quantity);
            let pnl = match front.side {
                Side::Buy => (fill.fill_price - front.price) * Decimal::from(closed_qty),
                Side::Sell => (front.price - fill.fill_price) * Decimal::from(closed_qty),
            };
            realized.push(RealizedTrade {
                symbol: fill.symbol.clone(),
                entry_side: front.side,
                entry_price: front.price,
                exit_price: fill.fill_price,
                quantity: closed_qty,
                pnl,
                entry_bar_number: front.bar_number,
                exit_bar_number: trade.bar_number,
            });
            front.quantity -= closed_qty;
            remaining -= closed_qty;
            if front.quantity == 0 {
                lots.remove(0);
            }
        }

        if remaining > 0 {
            lots.push(Lot { side: fill.direction, quantity: remaining, price: fill.fill_price, bar_number: trade.bar_number });
        }
    }

    realized
}

fn trade_stats(realized: &[RealizedTrade]) -> TradeStats {
    if realized.is_empty() {
        return TradeStats::default();
    }

    let winning_trades = realized.iter().filter(|t| t.is_win()).count();
    let losing_trades = realized.iter().filter(|t| t.pnl < Decimal::ZERO).count();

    let total_wins: Decimal = realized.iter().filter(|t| t.is_win()).map(|t| t.pnl).sum();
    let total_losses: Decimal = realized.iter().filter(|t| t.pnl < Decimal::ZERO).map(|t| t.pnl).sum();

    let average_win = if winning_trades > 0 { total_wins / Decimal::from(winning_trades) } else { Decimal::ZERO };
    let average_loss = if losing_trades > 0 { total_losses / Decimal::from(losing_trades) } else { Decimal::ZERO };

    let profit_factor = if total_losses.is_zero() {
        if total_wins.is_zero() { 0.0 } else { f64::INFINITY }
    } else {
        (total_wins / total_losses.abs()).to_f64().unwrap_or(0.0)
    };

    TradeStats {
        total_trades: realized.len(),
        winning_trades,
        losing_trades,
        win_rate_pct: winning_trades as f64 / realized.len() as f64 * 100.0,
        average_win,
        average_loss,
        profit_factor,
    }
}
