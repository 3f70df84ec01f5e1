use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::analyzer::PerformanceReport;
use crate::error::KernelError;
use crate::types::{Bar, EquityPoint, TradeRecord, UNKNOWN_STATE_LABEL};

fn csv_error(context: &str, err: csv::Error) -> KernelError {
    KernelError::input_validation(format!("{context}: {err}"))
}

const TRADE_LOG_STABLE_COLUMNS: &[&str] = &[
    "Trade_ID",
    "Date",
    "Bar_Number",
    "Strategy_State",
    "Ticker",
    "Decision",
    "Decision_Reason",
    "Order_Type",
    "Shares",
    "Fill_Price",
    "Position_Value",
    "Slippage",
    "Commission",
    "Portfolio_Value_Before",
    "Portfolio_Value_After",
    "Cash_Before",
    "Cash_After",
    "Allocation_Before",
    "Allocation_After",
    "Cumulative_Return_Pct",
];

fn sorted_key_union<'a, I>(maps: I) -> Vec<String>
where
    I: Iterator<Item = &'a std::collections::HashMap<String, Decimal>>,
{
    let mut keys = BTreeSet::new();
    for map in maps {
        keys.extend(map.keys().cloned());
    }
    keys.into_iter().collect()
}

fn trade_log_row(trade: &TradeRecord) -> Vec<String> {
    let fill = &trade.fill;
    let position_value = Decimal::from(fill.quantity) * fill.fill_price;
    let allocation_before = trade.before.allocations.get(&fill.symbol).copied().unwrap_or(Decimal::ZERO) * Decimal::from(100);
    let allocation_after = trade.after.allocations.get(&fill.symbol).copied().unwrap_or(Decimal::ZERO) * Decimal::from(100);

    vec![
        trade.trade_id.to_string(),
        fill.timestamp.to_rfc3339(),
        trade.bar_number.to_string(),
        if trade.state_label.is_empty() { UNKNOWN_STATE_LABEL.to_string() } else { trade.state_label.clone() },
        fill.symbol.clone(),
        format!("{:?}", fill.direction).to_uppercase(),
        trade.decision_reason.clone(),
        "MARKET".to_string(),
        fill.quantity.to_string(),
        fill.fill_price.to_string(),
        position_value.to_string(),
        // The kernel fills exactly at the bar's close (§1 Non-goals: no
        // bid/ask spread or market impact modeled), so slippage is always
        // zero; the column is kept because the CSV format names it.
        "0".to_string(),
        fill.commission.to_string(),
        trade.before.total_value.to_string(),
        trade.after.total_value.to_string(),
        trade.before.cash.to_string(),
        trade.after.cash.to_string(),
        allocation_before.to_string(),
        allocation_after.to_string(),
        (trade.cumulative_return_pct * Decimal::from(100)).to_string(),
    ]
}

fn format_metric(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.4}")).unwrap_or_else(|| "N/A".to_string())
}

/// `Key,Value` rows for the trailing `Summary Statistics:` section of the
/// trade log, covering every metric family in §4.6.
fn summary_statistics_kv(report: &PerformanceReport) -> Vec<(String, String)> {
    let mut kv = vec![
        ("Total_Return_Pct".to_string(), format!("{:.4}", report.total_return_pct)),
        ("Annualized_Return_Pct".to_string(), format_metric(report.annualized_return_pct)),
        ("Max_Drawdown_Pct".to_string(), format!("{:.4}", report.max_drawdown_pct)),
        ("Sharpe_Ratio".to_string(), format_metric(report.sharpe_ratio)),
        ("Total_Trades".to_string(), report.trade_stats.total_trades.to_string()),
        ("Winning_Trades".to_string(), report.trade_stats.winning_trades.to_string()),
        ("Losing_Trades".to_string(), report.trade_stats.losing_trades.to_string()),
        ("Win_Rate_Pct".to_string(), format!("{:.4}", report.trade_stats.win_rate_pct)),
        ("Average_Win".to_string(), report.trade_stats.average_win.to_string()),
        ("Average_Loss".to_string(), report.trade_stats.average_loss.to_string()),
        ("Profit_Factor".to_string(), format!("{:.4}", report.trade_stats.profit_factor)),
    ];
    match &report.baseline {
        Some(baseline) => {
            kv.push(("Buy_And_Hold_Return_Pct".to_string(), format!("{:.4}", baseline.buy_and_hold_return_pct)));
            kv.push(("Buy_And_Hold_Annualized_Return_Pct".to_string(), format_metric(baseline.buy_and_hold_annualized_return_pct)));
            kv.push(("Alpha".to_string(), format_metric(baseline.alpha)));
        }
        None => {
            kv.push(("Buy_And_Hold_Return_Pct".to_string(), "N/A".to_string()));
            kv.push(("Buy_And_Hold_Annualized_Return_Pct".to_string(), "N/A".to_string()));
            kv.push(("Alpha".to_string(), "N/A".to_string()));
        }
    }
    kv
}

/// Writes the per-trade log: one row per fill, joined with whatever strategy
/// context was correlated to it, followed by a dynamic `Indicator_`/
/// `Threshold_` column per name any trade logged, and a trailing
/// `Summary Statistics:` section (§6).
pub fn write_trade_log(path: &Path, trades: &[TradeRecord], report: &PerformanceReport) -> Result<(), KernelError> {
    let indicator_keys = sorted_key_union(trades.iter().map(|t| &t.indicators));
    let threshold_keys = sorted_key_union(trades.iter().map(|t| &t.thresholds));

    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());

    let mut header: Vec<String> = TRADE_LOG_STABLE_COLUMNS.iter().map(|s| s.to_string()).collect();
    header.extend(indicator_keys.iter().map(|k| format!("Indicator_{k}")));
    header.extend(threshold_keys.iter().map(|k| format!("Threshold_{k}")));
    writer.write_record(&header).map_err(|e| csv_error("writing trade log header", e))?;

    for trade in trades {
        let mut row = trade_log_row(trade);
        for key in &indicator_keys {
            row.push(trade.indicators.get(key).map(Decimal::to_string).unwrap_or_default());
        }
        for key in &threshold_keys {
            row.push(trade.thresholds.get(key).map(Decimal::to_string).unwrap_or_default());
        }
        writer.write_record(&row).map_err(|e| csv_error("writing trade log row", e))?;
    }

    let mut bytes = writer
        .into_inner()
        .map_err(|e| KernelError::input_validation(format!("finalizing trade log: {e}")))?;
    bytes.extend_from_slice(b"\nSummary Statistics:\n");
    for (key, value) in summary_statistics_kv(report) {
        bytes.extend_from_slice(format!("{key},{value}\n").as_bytes());
    }

    std::fs::write(path, bytes).map_err(|e| KernelError::input_validation(format!("writing trade log {}: {e}", path.display())))?;
    Ok(())
}

fn baseline_price_at_or_before(bars: &[Bar], ts: DateTime<Utc>) -> Option<Decimal> {
    let idx = bars.partition_point(|b| b.timestamp <= ts);
    if idx == 0 {
        None
    } else {
        Some(bars[idx - 1].close)
    }
}

/// Writes the daily portfolio snapshot: one row per bar, with an optional
/// baseline-symbol comparison and a `Qty`/`Value` column pair per ticker ever
/// held, per §6's `{strategy}_{ts}.csv` format.
pub fn write_portfolio_daily(
    path: &Path,
    equity_curve: &[EquityPoint],
    initial_capital: Decimal,
    baseline: Option<(&str, &[Bar])>,
) -> Result<(), KernelError> {
    let mut tickers: BTreeSet<String> = BTreeSet::new();
    for point in equity_curve {
        tickers.extend(point.positions.keys().cloned());
        tickers.extend(point.latest_prices.keys().cloned());
    }
    let tickers: Vec<String> = tickers.into_iter().collect();

    let mut header = vec![
        "Date".to_string(),
        "Portfolio_Total_Value".to_string(),
        "Portfolio_Day_Change_Pct".to_string(),
        "Portfolio_Overall_Return".to_string(),
        "Portfolio_PL_Percent".to_string(),
    ];
    if let Some((symbol, _)) = baseline {
        header.push(format!("Baseline_{symbol}_Value"));
        header.push(format!("Baseline_{symbol}_Return_Pct"));
    }
    header.push("Cash".to_string());
    for ticker in &tickers {
        header.push(format!("{ticker}_Qty"));
        header.push(format!("{ticker}_Value"));
    }

    let mut writer = csv::Writer::from_path(path).map_err(|e| csv_error("opening portfolio-daily csv", e))?;
    writer.write_record(&header).map_err(|e| csv_error("writing portfolio-daily header", e))?;

    let baseline_first_close = baseline.and_then(|(_, bars)| bars.first().map(|b| b.close));

    let mut prev_value: Option<Decimal> = None;
    for point in equity_curve {
        let mut row = Vec::with_capacity(header.len());
        row.push(point.timestamp.to_rfc3339());
        row.push(point.total_value.to_string());

        row.push(match prev_value {
            Some(prev) if !prev.is_zero() => ((point.total_value - prev) / prev * Decimal::from(100)).to_string(),
            _ => String::new(),
        });

        // Portfolio_Overall_Return and Portfolio_PL_Percent are the same
        // cumulative-return-since-start figure under two names (see
        // DESIGN.md: the §6 format lists both columns without
        // distinguishing their formulas).
        let overall_return = if initial_capital.is_zero() {
            String::new()
        } else {
            ((point.total_value - initial_capital) / initial_capital * Decimal::from(100)).to_string()
        };
        row.push(overall_return.clone());
        row.push(overall_return);

        if let Some((_, bars)) = baseline {
            match (baseline_price_at_or_before(bars, point.timestamp), baseline_first_close) {
                (Some(price), Some(first_close)) if !first_close.is_zero() => {
                    row.push(price.to_string());
                    row.push(((price - first_close) / first_close * Decimal::from(100)).to_string());
                }
                (Some(price), _) => {
                    row.push(price.to_string());
                    row.push(String::new());
                }
                (None, _) => {
                    row.push(String::new());
                    row.push(String::new());
                }
            }
        }

        row.push(point.cash.to_string());

        for ticker in &tickers {
            let qty = point.positions.get(ticker).copied().unwrap_or(0);
            let price = point.latest_prices.get(ticker).copied().unwrap_or(Decimal::ZERO);
            row.push(qty.to_string());
            row.push((Decimal::from(qty) * price).to_string());
        }

        writer.write_record(&row).map_err(|e| csv_error("writing portfolio-daily row", e))?;
        prev_value = Some(point.total_value);
    }

    writer.flush().map_err(|e| KernelError::input_validation(format!("flushing portfolio-daily csv: {e}")))?;
    Ok(())
}

struct SummaryRow {
    category: &'static str,
    metric: &'static str,
    baseline: Option<f64>,
    strategy: Option<f64>,
}

/// Writes the one-summary-per-run CSV in the `Category, Metric, Baseline,
/// Strategy, Difference` shape of §6, with categories `Performance, Risk,
/// Trading, Comparison`.
pub fn write_summary(path: &Path, report: &PerformanceReport) -> Result<(), KernelError> {
    let baseline = report.baseline.as_ref();
    let average_win = report.trade_stats.average_win.to_f64().unwrap_or(0.0);
    let average_loss = report.trade_stats.average_loss.to_f64().unwrap_or(0.0);

    let rows = vec![
        SummaryRow {
            category: "Performance",
            metric: "Total_Return_Pct",
            baseline: baseline.map(|b| b.buy_and_hold_return_pct),
            strategy: Some(report.total_return_pct),
        },
        SummaryRow {
            category: "Performance",
            metric: "Annualized_Return_Pct",
            baseline: baseline.and_then(|b| b.buy_and_hold_annualized_return_pct),
            strategy: report.annualized_return_pct,
        },
        SummaryRow { category: "Risk", metric: "Max_Drawdown_Pct", baseline: None, strategy: Some(report.max_drawdown_pct) },
        SummaryRow { category: "Risk", metric: "Sharpe_Ratio", baseline: None, strategy: report.sharpe_ratio },
        SummaryRow {
            category: "Trading",
            metric: "Total_Trades",
            baseline: None,
            strategy: Some(report.trade_stats.total_trades as f64),
        },
        SummaryRow { category: "Trading", metric: "Win_Rate_Pct", baseline: None, strategy: Some(report.trade_stats.win_rate_pct) },
        SummaryRow { category: "Trading", metric: "Average_Win", baseline: None, strategy: Some(average_win) },
        SummaryRow { category: "Trading", metric: "Average_Loss", baseline: None, strategy: Some(average_loss) },
        SummaryRow {
            category: "Trading",
            metric: "Profit_Factor",
            baseline: None,
            strategy: Some(report.trade_stats.profit_factor),
        },
        SummaryRow {
            category: "Comparison",
            metric: "Buy_And_Hold_Return_Pct",
            baseline: baseline.map(|b| b.buy_and_hold_return_pct),
            strategy: None,
        },
        // Alpha's "Baseline" column is the parity line (ratio == 1.0 means
        // the strategy matched the baseline exactly); Difference is then how
        // far above or below parity the strategy landed.
        SummaryRow { category: "Comparison", metric: "Alpha", baseline: Some(1.0), strategy: baseline.and_then(|b| b.alpha) },
    ];

    let mut writer = csv::Writer::from_path(path).map_err(|e| csv_error("opening summary csv", e))?;
    writer
        .write_record(["Category", "Metric", "Baseline", "Strategy", "Difference"])
        .map_err(|e| csv_error("writing summary header", e))?;

    for row in rows {
        let difference = match (row.baseline, row.strategy) {
            (Some(b), Some(s)) => format!("{:.4}", s - b),
            _ => "N/A".to_string(),
        };
        writer
            .write_record([
                row.category.to_string(),
                row.metric.to_string(),
                row.baseline.map(|v| format!("{v:.4}")).unwrap_or_else(|| "N/A".to_string()),
                row.strategy.map(|v| format!("{v:.4}")).unwrap_or_else(|| "N/A".to_string()),
                difference,
            ])
            .map_err(|e| csv_error("writing summary row", e))?;
    }

    writer.flush().map_err(|e| KernelError::input_validation(format!("flushing summary csv: {e}")))?;
    Ok(())
}

/// A single row of `summary_comparison.csv`: one grid-search configuration's
/// summary, plus the `alpha` column every row shares (row `000` is always the
/// baseline buy-and-hold and carries no alpha of its own). Also the shape
/// persisted per completed run in `checkpoint.json`, so a resumed grid search
/// can reconstruct the rows a prior session already produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub config_id: String,
    pub strategy_name: String,
    pub params: String,
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: Option<f64>,
    pub alpha: Option<f64>,
}

pub fn write_summary_comparison(path: &Path, rows: &[ComparisonRow]) -> Result<(), KernelError> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| csv_error("opening summary_comparison csv", e))?;
    writer
        .write_record(["config_id", "strategy", "params", "total_return_pct", "max_drawdown_pct", "sharpe_ratio", "alpha"])
        .map_err(|e| csv_error("writing summary_comparison header", e))?;
    for row in rows {
        writer
            .write_record([
                row.config_id.clone(),
                row.strategy_name.clone(),
                row.params.clone(),
                format!("{:.4}", row.total_return_pct),
                format!("{:.4}", row.max_drawdown_pct),
                row.sharpe_ratio.map(|v| format!("{v:.4}")).unwrap_or_default(),
                row.alpha.map(|v| format!("{v:.4}")).unwrap_or_default(),
            ])
            .map_err(|e| csv_error("writing summary_comparison row", e))?;
    }
    writer.flush().map_err(|e| KernelError::input_validation(format!("flushing summary_comparison csv: {e}")))?;
    Ok(())
}

/// A short human-readable `README.txt` dropped alongside a grid-search run's
/// CSVs: what was swept, how many configs ran, and how to read the columns.
pub fn write_grid_readme(
    path: &Path,
    strategy_name: &str,
    param_names: &[String],
    total_configs: usize,
    failed_configs: usize,
) -> Result<(), KernelError> {
    let mut file = std::fs::File::create(path).map_err(|e| KernelError::input_validation(format!("creating README.txt: {e}")))?;
    writeln!(file, "Grid search: {strategy_name}").map_err(io_err)?;
    writeln!(file, "Parameters swept: {}", param_names.join(", ")).map_err(io_err)?;
    writeln!(file, "Total configurations: {total_configs}").map_err(io_err)?;
    writeln!(file, "Failed configurations: {failed_configs}").map_err(io_err)?;
    writeln!(file, "Row 000 in summary_comparison.csv is the buy-and-hold baseline; alpha is each row's").map_err(io_err)?;
    writeln!(file, "total_return_pct divided by the baseline's (1.0 means it matched the baseline exactly).").map_err(io_err)?;
    Ok(())
}

fn io_err(e: std::io::Error) -> KernelError {
    KernelError::input_validation(format!("writing README.txt: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{AnalyzerConfig, PerformanceAnalyzer};
    use rust_decimal::Decimal;
    use tempfile::tempdir;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn sample_trade() -> TradeRecord {
        let mut indicators = std::collections::HashMap::new();
        indicators.insert("rsi".to_string(), Decimal::from(28));
        TradeRecord {
            trade_id: 1,
            fill: crate::types::Fill {
                symbol: "X".to_string(),
                direction: crate::types::Side::Buy,
                quantity: 10,
                fill_price: Decimal::from(100),
                commission: Decimal::ZERO,
                timestamp: ts("2024-01-01T00:00:00Z"),
            },
            bar_number: 1,
            state_label: "Breakout".to_string(),
            decision_reason: "test".to_string(),
            indicators,
            thresholds: Default::default(),
            before: crate::types::PortfolioSnapshot { total_value: Decimal::ZERO, cash: Decimal::ZERO, allocations: Default::default() },
            after: crate::types::PortfolioSnapshot { total_value: Decimal::from(1000), cash: Decimal::ZERO, allocations: Default::default() },
            cumulative_return_pct: Decimal::ZERO,
        }
    }

    #[test]
    fn writes_trade_log_with_dynamic_indicator_column_and_summary_footer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trades.csv");
        let trades = vec![sample_trade()];
        let curve = vec![EquityPoint::bare(ts("2024-01-01T00:00:00Z"), Decimal::from(1000))];
        let report = PerformanceAnalyzer::compute(&curve, &trades, Decimal::from(1000), None, &AnalyzerConfig::default());
        write_trade_log(&path, &trades, &report).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("Trade_ID,Date,Bar_Number"));
        assert!(header.contains("Indicator_rsi"));
        assert!(content.contains("Breakout"));
        assert!(content.contains("Summary Statistics:"));
        assert!(content.contains("Total_Return_Pct"));
    }

    #[test]
    fn writes_portfolio_daily_with_per_ticker_and_baseline_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daily.csv");
        let mut positions = std::collections::HashMap::new();
        positions.insert("X".to_string(), 10i64);
        let mut prices = std::collections::HashMap::new();
        prices.insert("X".to_string(), Decimal::from(105));
        let curve = vec![EquityPoint {
            timestamp: ts("2024-01-02T00:00:00Z"),
            total_value: Decimal::from(2050),
            cash: Decimal::from(1000),
            positions,
            latest_prices: prices,
        }];
        let baseline_bars = vec![
            Bar { symbol: "Q".to_string(), timestamp: ts("2024-01-01T00:00:00Z"), open: Decimal::from(100), high: Decimal::from(100), low: Decimal::from(100), close: Decimal::from(100), volume: Decimal::ZERO },
            Bar { symbol: "Q".to_string(), timestamp: ts("2024-01-02T00:00:00Z"), open: Decimal::from(110), high: Decimal::from(110), low: Decimal::from(110), close: Decimal::from(110), volume: Decimal::ZERO },
        ];
        write_portfolio_daily(&path, &curve, Decimal::from(1000), Some(("Q", &baseline_bars))).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let header = content.lines().next().unwrap();
        assert!(header.contains("Baseline_Q_Value"));
        assert!(header.contains("X_Qty"));
        assert!(header.contains("X_Value"));
        let data = content.lines().nth(1).unwrap();
        assert!(data.contains("110")); // baseline close on 2024-01-02
    }

    #[test]
    fn writes_summary_in_category_metric_baseline_strategy_shape() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        let curve = vec![EquityPoint::bare(ts("2024-01-01T00:00:00Z"), Decimal::from(1000))];
        let report = PerformanceAnalyzer::compute(&curve, &[], Decimal::from(1000), None, &AnalyzerConfig::default());
        write_summary(&path, &report).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("Category,Metric,Baseline,Strategy,Difference"));
        assert!(content.contains("Performance,Total_Return_Pct"));
        assert!(content.contains("Comparison,Alpha"));
    }
}
