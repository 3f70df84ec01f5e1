use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::info;

use crate::analyzer::{AnalyzerConfig, PerformanceAnalyzer, PerformanceReport};
use crate::csv_output;
use crate::error::KernelError;
use crate::event_loop::{EventLoop, RunOutcome};
use crate::feed::MergedBarFeed;
use crate::portfolio::Portfolio;
use crate::strategy::Strategy;
use crate::types::{Bar, EquityPoint, TradeRecord};

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub initial_capital: Decimal,
    pub commission_per_share: Decimal,
    /// Bars of history `StrategyContext` keeps per symbol.
    pub max_history: usize,
    pub analyzer: AnalyzerConfig,
    pub output_dir: PathBuf,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: Decimal::from(100_000),
            commission_per_share: Decimal::ZERO,
            max_history: 252,
            analyzer: AnalyzerConfig::default(),
            output_dir: PathBuf::from("."),
        }
    }
}

pub struct BacktestRunResult {
    pub report: PerformanceReport,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<TradeRecord>,
    /// `{output_dir}/{strategy_name}_{run_timestamp}/`, containing
    /// `trades/trade_log.csv`, `portfolio_daily.csv`, and `summary.csv`.
    pub artifact_dir: PathBuf,
}

/// Wires a strategy, a bar feed, and a portfolio into a single run and
/// writes its artifacts to disk.
///
/// `run_timestamp` names the artifact directory; it is supplied by the
/// caller rather than read from the system clock so that two invocations
/// with identical inputs produce byte-identical output trees (aside from
/// the directory name itself).
pub struct BacktestRunner;

impl BacktestRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        mut strategy: Box<dyn Strategy>,
        bars_by_symbol: HashMap<String, Vec<Bar>>,
        required_symbols: &[&str],
        params: &HashMap<String, String>,
        config: &BacktestConfig,
        baseline_symbol: Option<&str>,
        run_timestamp: DateTime<Utc>,
    ) -> Result<BacktestRunResult, KernelError> {
        strategy.init(params).map_err(|e| KernelError::Strategy {
            symbol: required_symbols.first().map(|s| s.to_string()).unwrap_or_default(),
            timestamp: run_timestamp,
            source: anyhow::anyhow!(e.to_string()),
        })?;

        let strategy_name = strategy.name().to_string();
        let baseline_bars = baseline_symbol.and_then(|sym| bars_by_symbol.get(sym).cloned());

        let feed = MergedBarFeed::new(bars_by_symbol, required_symbols)?;
        let portfolio = Portfolio::new(config.initial_capital, config.commission_per_share);
        let event_loop = EventLoop::new(feed, strategy, portfolio, config.max_history);

        let (equity_curve, trades) = match event_loop.run() {
            RunOutcome::Completed { equity_curve, trades } => (equity_curve, trades),
            RunOutcome::Failed { error, .. } => return Err(error),
        };

        let report = PerformanceAnalyzer::compute(
            &equity_curve,
            &trades,
            config.initial_capital,
            baseline_bars.as_deref(),
            &config.analyzer,
        );

        let artifact_dir = config.output_dir.join(format!("{strategy_name}_{}", run_timestamp.format("%Y%m%dT%H%M%SZ")));
        let baseline_for_csv = baseline_symbol.zip(baseline_bars.as_deref());
        write_artifacts(&artifact_dir, &equity_curve, &trades, &report, config.initial_capital, baseline_for_csv)?;

        info!(strategy = %strategy_name, artifact_dir = %artifact_dir.display(), "backtest run complete");

        Ok(BacktestRunResult { report, equity_curve, trades, artifact_dir })
    }
}

fn write_artifacts(
    artifact_dir: &std::path::Path,
    equity_curve: &[EquityPoint],
    trades: &[TradeRecord],
    report: &PerformanceReport,
    initial_capital: Decimal,
    baseline: Option<(&str, &[Bar])>,
) -> Result<(), KernelError> {
    let trades_dir = artifact_dir.join("trades");
    std::fs::create_dir_all(&trades_dir)
        .map_err(|e| KernelError::input_validation(format!("creating artifact directory {}: {e}", trades_dir.display())))?;

    csv_output::write_trade_log(&trades_dir.join("trade_log.csv"), trades, report)?;
    csv_output::write_portfolio_daily(&artifact_dir.join("portfolio_daily.csv"), equity_curve, initial_capital, baseline)?;
    csv_output::write_summary(&artifact_dir.join("summary.csv"), report)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::StrategyContext;
    use tempfile::tempdir;

    struct AlwaysBuy;
    impl Strategy for AlwaysBuy {
        fn on_bar(&mut self, ctx: &mut StrategyContext) {
            if !ctx.has_position("X") {
                ctx.buy("X", Decimal::ONE);
            }
        }
        fn name(&self) -> &str {
            "always_buy"
        }
    }

    fn bar(symbol: &str, ts: &str, close: i64) -> Bar {
        let c = Decimal::from(close);
        Bar {
            symbol: symbol.to_string(),
            timestamp: ts.parse::<DateTime<Utc>>().unwrap(),
            open: c,
            high: c,
            low: c,
            close: c,
            volume: Decimal::from(1000),
        }
    }

    #[test]
    fn run_writes_expected_artifact_tree() {
        let dir = tempdir().unwrap();
        let mut bars_by_symbol = HashMap::new();
        bars_by_symbol.insert(
            "X".to_string(),
            vec![bar("X", "2024-01-01T00:00:00Z", 100), bar("X", "2024-01-02T00:00:00Z", 110)],
        );

        let config = BacktestConfig { output_dir: dir.path().to_path_buf(), ..Default::default() };
        let result = BacktestRunner::run(
            Box::new(AlwaysBuy),
            bars_by_symbol,
            &["X"],
            &HashMap::new(),
            &config,
            Some("X"),
            "2024-06-01T00:00:00Z".parse().unwrap(),
        )
        .unwrap();

        assert!(result.artifact_dir.join("trades").join("trade_log.csv").exists());
        assert!(result.artifact_dir.join("portfolio_daily.csv").exists());
        assert!(result.artifact_dir.join("summary.csv").exists());
        assert_eq!(result.equity_curve.len(), 2);
    }
}
