use std::collections::HashMap;

use chrono::Datelike;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::analyzer::RealizedTrade;
use crate::types::EquityPoint;

/// One peak-to-recovery drawdown episode. `end_bar_number` is `None` while
/// the drawdown that started the episode has not yet recovered by the end
/// of the run.
#[derive(Debug, Clone)]
pub struct DrawdownEvent {
    pub peak_bar_number: u64,
    pub trough_bar_number: u64,
    pub end_bar_number: Option<u64>,
    pub depth_pct: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct MonthlyReturn {
    pub year: i32,
    pub month: u32,
    pub return_pct: f64,
}

#[derive(Debug, Clone, Default)]
pub struct StreakDistribution {
    pub max_win_streak: u32,
    pub max_loss_streak: u32,
}

/// Supplementary analytics computed only when `AnalyzerConfig::extended_analytics`
/// is set. Every ratio here is optional because each has a degenerate input
/// (zero downside deviation, zero max drawdown, zero losing trades) under
/// which the ratio is undefined rather than zero.
#[derive(Debug, Clone)]
pub struct ExtendedAnalytics {
    pub sortino_ratio: Option<f64>,
    pub calmar_ratio: Option<f64>,
    pub recovery_factor: Option<f64>,
    pub drawdown_events: Vec<DrawdownEvent>,
    pub monthly_returns: Vec<MonthlyReturn>,
    pub expectancy: Decimal,
    pub kelly_fraction: Option<f64>,
    pub average_payoff_ratio: Option<f64>,
    pub system_quality_number: Option<f64>,
    pub streaks: StreakDistribution,
    pub time_in_market_pct: f64,
}

pub(crate) fn compute(equity_curve: &[EquityPoint], realized: &[RealizedTrade], periods_per_year: u32) -> ExtendedAnalytics {
    let drawdown_events = drawdown_events(equity_curve);
    let max_dd_pct = drawdown_events.iter().map(|e| e.depth_pct).fold(0.0, f64::min);

    let total_return_pct = total_return(equity_curve);
    let calmar_ratio = if max_dd_pct < 0.0 { Some(total_return_pct / max_dd_pct.abs()) } else { None };
    let recovery_factor = if max_dd_pct < 0.0 {
        let net_profit = equity_curve.last().map(|p| p.total_value).unwrap_or(Decimal::ZERO)
            - equity_curve.first().map(|p| p.total_value).unwrap_or(Decimal::ZERO);
        net_profit.to_f64().map(|np| np / max_dd_pct.abs())
    } else {
        None
    };

    let sortino_ratio = sortino_ratio(equity_curve, periods_per_year);
    let monthly_returns = monthly_returns(equity_curve);
    let expectancy = expectancy(realized);
    let kelly_fraction = kelly_fraction(realized);
    let average_payoff_ratio = average_payoff_ratio(realized);
    let system_quality_number = system_quality_number(realized);
    let streaks = streak_distribution(realized);
    let time_in_market_pct = time_in_market(equity_curve, realized);

    ExtendedAnalytics {
        sortino_ratio,
        calmar_ratio,
        recovery_factor,
        drawdown_events,
        monthly_returns,
        expectancy,
        kelly_fraction,
        average_payoff_ratio,
        system_quality_number,
        streaks,
        time_in_market_pct,
    }
}

fn total_return(equity_curve: &[EquityPoint]) -> f64 {
    let (Some(first), Some(last)) = (equity_curve.first(), equity_curve.last()) else {
        return 0.0;
    };
    if first.total_value.is_zero() {
        return 0.0;
    }
    ((last.total_value - first.total_value) / first.total_value).to_f64().unwrap_or(0.0) * 100.0
}

/// Segments the equity curve into peak-to-recovery episodes. A new episode
/// starts whenever equity sets a new high; it ends the bar equity first
/// re-touches that peak, or stays open if it never does.
fn drawdown_events(equity_curve: &[EquityPoint]) -> Vec<DrawdownEvent> {
    let mut events = Vec::new();
    let mut peak = Decimal::ZERO;
    let mut peak_bar: u64 = 0;
    let mut in_drawdown = false;
    let mut trough = Decimal::ZERO;
    let mut trough_bar: u64 = 0;

    for (idx, point) in equity_curve.iter().enumerate() {
        let bar_number = (idx + 1) as u64;
        if point.total_value >= peak {
            if in_drawdown {
                let depth_pct = if peak.is_zero() { 0.0 } else { ((trough - peak) / peak).to_f64().unwrap_or(0.0) * 100.0 };
                events.push(DrawdownEvent {
                    peak_bar_number: peak_bar,
                    trough_bar_number: trough_bar,
                    end_bar_number: Some(bar_number),
                    depth_pct,
                });
                in_drawdown = false;
            }
            peak = point.total_value;
            peak_bar = bar_number;
        } else {
            if !in_drawdown || point.total_value < trough {
                trough = point.total_value;
                trough_bar = bar_number;
            }
            in_drawdown = true;
        }
    }

    if in_drawdown {
        let depth_pct = if peak.is_zero() { 0.0 } else { ((trough - peak) / peak).to_f64().unwrap_or(0.0) * 100.0 };
        events.push(DrawdownEvent { peak_bar_number: peak_bar, trough_bar_number: trough_bar, end_bar_number: None, depth_pct });
    }

    events
}

fn sortino_ratio(equity_curve: &[EquityPoint], periods_per_year: u32) -> Option<f64> {
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
    if returns.is_empty() {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.is_empty() {
        return None;
    }
    let downside_dev = (downside.iter().map(|r| r.powi(2)).sum::<f64>() / downside.len() as f64).sqrt();
    if downside_dev == 0.0 {
        return None;
    }
    Some(mean / downside_dev * (periods_per_year as f64).sqrt())
}

fn monthly_returns(equity_curve: &[EquityPoint]) -> Vec<MonthlyReturn> {
    let mut by_month: Vec<(i32, u32, Decimal, Decimal)> = Vec::new(); // (year, month, first, last)
    for point in equity_curve {
        let year = point.timestamp.year();
        let month = point.timestamp.month();
        match by_month.last_mut() {
            Some((y, m, _first, last)) if *y == year && *m == month => {
                *last = point.total_value;
            }
            _ => by_month.push((year, month, point.total_value, point.total_value)),
        }
    }
    by_month
        .into_iter()
        .map(|(year, month, first, last)| {
            let return_pct = if first.is_zero() { 0.0 } else { ((last - first) / first).to_f64().unwrap_or(0.0) * 100.0 };
            MonthlyReturn { year, month, return_pct }
        })
        .collect()
}

fn expectancy(realized: &[RealizedTrade]) -> Decimal {
    if realized.is_empty() {
        return Decimal::ZERO;
    }
    let total: Decimal = realized.iter().map(|t| t.pnl).sum();
    total / Decimal::from(realized.len())
}

/// Full Kelly fraction `f* = W - (1 - W) / R`, where `W` is win rate and `R`
/// is the average-win/average-loss payoff ratio. `None` when there have
/// never been any losses to form a payoff ratio from.
fn kelly_fraction(realized: &[RealizedTrade]) -> Option<f64> {
    if realized.is_empty() {
        return None;
    }
    let wins: Vec<&RealizedTrade> = realized.iter().filter(|t| t.pnl > Decimal::ZERO).collect();
    let losses: Vec<&RealizedTrade> = realized.iter().filter(|t| t.pnl < Decimal::ZERO).collect();
    if losses.is_empty() {
        return None;
    }
    let win_rate = wins.len() as f64 / realized.len() as f64;
    let avg_win = wins.iter().map(|t| t.pnl).sum::<Decimal>().to_f64().unwrap_or(0.0) / wins.len().max(1) as f64;
    let avg_loss = losses.iter().map(|t| t.pnl).sum::<Decimal>().to_f64().unwrap_or(0.0).abs() / losses.len() as f64;
    if avg_loss == 0.0 {
        return None;
    }
    let payoff_ratio = avg_win / avg_loss;
    Some(win_rate - (1.0 - win_rate) / payoff_ratio)
}

fn average_payoff_ratio(realized: &[RealizedTrade]) -> Option<f64> {
    let wins: Vec<&RealizedTrade> = realized.iter().filter(|t| t.pnl > Decimal::ZERO).collect();
    let losses: Vec<&RealizedTrade> = realized.iter().filter(|t| t.pnl < Decimal::ZERO).collect();
    if wins.is_empty() || losses.is_empty() {
        return None;
    }
    let avg_win = wins.iter().map(|t| t.pnl).sum::<Decimal>().to_f64().unwrap_or(0.0) / wins.len() as f64;
    let avg_loss = losses.iter().map(|t| t.pnl).sum::<Decimal>().to_f64().unwrap_or(0.0).abs() / losses.len() as f64;
    if avg_loss == 0.0 {
        return None;
    }
    Some(avg_win / avg_loss)
}

/// System Quality Number: `sqrt(n) * mean(pnl) / stdev(pnl)`.
fn system_quality_number(realized: &[RealizedTrade]) -> Option<f64> {
    if realized.len() < 2 {
        return None;
    }
    let pnls: Vec<f64> = realized.iter().filter_map(|t| t.pnl.to_f64()).collect();
    let mean = pnls.iter().sum::<f64>() / pnls.len() as f64;
    let variance = pnls.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / (pnls.len() - 1) as f64;
    let stdev = variance.sqrt();
    if stdev == 0.0 {
        return None;
    }
    Some((pnls.len() as f64).sqrt() * mean / stdev)
}

fn streak_distribution(realized: &[RealizedTrade]) -> StreakDistribution {
    let mut max_win = 0u32;
    let mut max_loss = 0u32;
    let mut current_win = 0u32;
    let mut current_loss = 0u32;
    for trade in realized {
        if trade.pnl > Decimal::ZERO {
            current_win += 1;
            current_loss = 0;
        } else if trade.pnl < Decimal::ZERO {
            current_loss += 1;
            current_win = 0;
        } else {
            current_win = 0;
            current_loss = 0;
        }
        max_win = max_win.max(current_win);
        max_loss = max_loss.max(current_loss);
    }
    StreakDistribution { max_win_streak: max_win, max_loss_streak: max_loss }
}

/// Fraction of bars during which at least one realized round trip was open,
/// approximated from entry/exit bar numbers rather than a per-bar position
/// flag (the kernel does not retain one).
fn time_in_market(equity_curve: &[EquityPoint], realized: &[RealizedTrade]) -> f64 {
    if equity_curve.is_empty() {
        return 0.0;
    }
    let total_bars = equity_curve.len() as u64;
    let mut covered = vec![false; total_bars as usize];
    for trade in realized {
        let start = trade.entry_bar_number.max(1) as usize - 1;
        let end = (trade.exit_bar_number as usize).min(total_bars as usize);
        for slot in covered.iter_mut().take(end).skip(start) {
            *slot = true;
        }
    }
    let covered_count = covered.iter().filter(|c| **c).count();
    covered_count as f64 / total_bars as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use chrono::TimeZone;

    fn point(year: i32, month: u32, day: u32, value: i64) -> EquityPoint {
        let timestamp = chrono::Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap();
        EquityPoint::bare(timestamp, Decimal::from(value))
    }

    fn trade(pnl: i64, entry_bar: u64, exit_bar: u64) -> RealizedTrade {
        RealizedTrade {
            symbol: "X".to_string(),
            entry_side: Side::Buy,
            entry_price: Decimal::from(100),
            exit_price: Decimal::from(100 + pnl),
            quantity: 1,
            pnl: Decimal::from(pnl),
            entry_bar_number: entry_bar,
            exit_bar_number: exit_bar,
        }
    }

    #[test]
    fn monthly_returns_groups_by_calendar_month() {
        let curve = vec![point(2024, 1, 1, 1000), point(2024, 1, 31, 1100), point(2024, 2, 1, 1150)];
        let mr = monthly_returns(&curve);
        assert_eq!(mr.len(), 2);
        assert_eq!(mr[0].month, 1);
        assert_eq!(mr[1].month, 2);
    }

    #[test]
    fn drawdown_events_close_on_recovery() {
        let curve = vec![point(2024, 1, 1, 1000), point(2024, 1, 2, 900), point(2024, 1, 3, 1000), point(2024, 1, 4, 1100)];
        let events = drawdown_events(&curve);
        assert_eq!(events.len(), 1);
        assert!(events[0].end_bar_number.is_some());
        assert!((events[0].depth_pct - (-10.0)).abs() < 1e-9);
    }

    #[test]
    fn streak_distribution_tracks_longest_runs() {
        let trades = vec![trade(10, 1, 2), trade(10, 3, 4), trade(-5, 5, 6), trade(10, 7, 8)];
        let streaks = streak_distribution(&trades);
        assert_eq!(streaks.max_win_streak, 2);
        assert_eq!(streaks.max_loss_streak, 1);
    }

    #[test]
    fn kelly_fraction_is_none_without_any_losses() {
        let trades = vec![trade(10, 1, 2), trade(20, 3, 4)];
        assert!(kelly_fraction(&trades).is_none());
    }

    #[test]
    fn time_in_market_covers_bars_between_entry_and_exit() {
        let curve = vec![point(2024, 1, 1, 1000), point(2024, 1, 2, 1000), point(2024, 1, 3, 1000), point(2024, 1, 4, 1000)];
        let trades = vec![trade(10, 1, 2)];
        let pct = time_in_market(&curve, &trades);
        assert!((pct - 50.0).abs() < 1e-9);
    }
}
