use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::analyzer::{AnalyzerConfig, PerformanceAnalyzer};
use crate::csv_output::{self, ComparisonRow};
use crate::error::KernelError;
use crate::runner::{BacktestConfig, BacktestRunner};
use crate::strategy::StrategyRegistry;
use crate::types::{Bar, EquityPoint};

fn default_max_combinations() -> usize {
    500
}

fn default_checkpoint_interval() -> usize {
    10
}

fn default_baseline_symbol() -> Option<String> {
    Some("QQQ".to_string())
}

/// One named binding of abstract trading roles (signal/bull/defense/vix) to
/// concrete tickers, per §6's grid-search YAML surface. Strategies that
/// request a volatility filter require `vix_symbol`; this is checked at
/// `validate()` rather than left to fail mid-run.
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolSet {
    pub name: String,
    pub signal_symbol: String,
    pub bull_symbol: String,
    pub defense_symbol: String,
    #[serde(default)]
    pub vix_symbol: Option<String>,
}

impl SymbolSet {
    /// The roles this symbol set binds, as `(role, symbol)` pairs suitable
    /// for folding into a run's parameter map.
    fn role_bindings(&self) -> Vec<(&'static str, String)> {
        let mut bindings = vec![
            ("signal_symbol", self.signal_symbol.clone()),
            ("bull_symbol", self.bull_symbol.clone()),
            ("defense_symbol", self.defense_symbol.clone()),
        ];
        if let Some(vix) = &self.vix_symbol {
            bindings.push(("vix_symbol", vix.clone()));
        }
        bindings
    }

    fn required_symbols(&self) -> Vec<String> {
        self.role_bindings().into_iter().map(|(_, sym)| sym).collect()
    }
}

/// Deserialized from the grid-search YAML surface: `start_date`/`end_date`
/// are kept as strings at this boundary and parsed by the caller before
/// reaching the kernel (§6: "Dates in YAML are strings and must be parsed
/// before reaching the kernel").
#[derive(Debug, Clone, Deserialize)]
pub struct BaseConfig {
    pub start_date: String,
    pub end_date: String,
    pub timeframe: String,
    pub initial_capital: Decimal,
    pub commission: Decimal,
    #[serde(default)]
    pub slippage: Decimal,
}

/// Deserialized from the grid-search YAML surface: one strategy, one or more
/// symbol-set bindings, a base run configuration, and a grid of parameter
/// values to sweep over every symbol set.
#[derive(Debug, Clone, Deserialize)]
pub struct GridSearchConfig {
    pub strategy: String,
    #[serde(default)]
    pub symbol_sets: Vec<SymbolSet>,
    pub base_config: Option<BaseConfig>,
    #[serde(default)]
    pub parameters: HashMap<String, Vec<String>>,
    #[serde(default = "default_baseline_symbol")]
    pub baseline_symbol: Option<String>,
    #[serde(default = "default_max_combinations")]
    pub max_combinations: usize,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
    /// Explicit override for the `max_combinations` warning (§6: "require
    /// explicit confirmation or config override"); the kernel has no
    /// interactive prompt, so a config-level flag is the only avenue.
    #[serde(default)]
    pub allow_large_grid: bool,
}

impl GridSearchConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, KernelError> {
        serde_yaml::from_str(yaml).map_err(|e| KernelError::configuration(format!("invalid grid-search config: {e}")))
    }

    /// Validates cross-field constraints `serde` itself can't express:
    /// `base_config` must be present, and any symbol set a
    /// volatility-filtering strategy depends on must carry `vix_symbol`.
    pub fn validate(&self, strategy_requires_vix: bool) -> Result<(), KernelError> {
        if self.base_config.is_none() {
            return Err(KernelError::configuration("grid-search config is missing base_config"));
        }
        if strategy_requires_vix {
            for set in &self.symbol_sets {
                if set.vix_symbol.is_none() {
                    return Err(KernelError::configuration(format!(
                        "symbol set '{}' is missing vix_symbol, required by strategy '{}'",
                        set.name, self.strategy
                    )));
                }
            }
        }
        if self.checkpoint_interval == 0 {
            return Err(KernelError::configuration("checkpoint_interval must be at least 1"));
        }
        Ok(())
    }
}

/// Cartesian product over `parameters`, each combination returned as a
/// string-keyed parameter map ready for `Strategy::init`. Iterates keys in
/// sorted order so the same config always expands to the same sequence of
/// `config_id`s.
fn expand_grid(parameters: &HashMap<String, Vec<String>>) -> Vec<HashMap<String, String>> {
    let mut keys: Vec<&String> = parameters.keys().collect();
    keys.sort();

    let mut combos: Vec<HashMap<String, String>> = vec![HashMap::new()];
    for key in keys {
        let values = &parameters[key];
        let mut next = Vec::with_capacity(combos.len() * values.len().max(1));
        for combo in &combos {
            for value in values {
                let mut extended = combo.clone();
                extended.insert(key.clone(), value.clone());
                next.push(extended);
            }
        }
        combos = next;
    }
    combos
}

/// One fully expanded run: a symbol set paired with one parameter
/// combination, its role bindings folded into the parameter map under
/// reserved keys (`signal_symbol`, `bull_symbol`, `defense_symbol`,
/// `vix_symbol`) so a strategy can read them from `init`'s params like any
/// other setting.
struct PlannedRun {
    symbol_set_name: Option<String>,
    required_symbols: Vec<String>,
    params: HashMap<String, String>,
}

fn expand_runs(grid_config: &GridSearchConfig) -> Vec<PlannedRun> {
    let param_combos = expand_grid(&grid_config.parameters);

    if grid_config.symbol_sets.is_empty() {
        return param_combos
            .into_iter()
            .map(|params| PlannedRun { symbol_set_name: None, required_symbols: Vec::new(), params })
            .collect();
    }

    let mut runs = Vec::with_capacity(grid_config.symbol_sets.len() * param_combos.len().max(1));
    for set in &grid_config.symbol_sets {
        for params in &param_combos {
            let mut merged = params.clone();
            for (role, symbol) in set.role_bindings() {
                merged.insert(role.to_string(), symbol);
            }
            runs.push(PlannedRun {
                symbol_set_name: Some(set.name.clone()),
                required_symbols: set.required_symbols(),
                params: merged,
            });
        }
    }
    runs
}

pub struct GridSearchSummary {
    pub rows: Vec<ComparisonRow>,
    pub successful: usize,
    pub failed: usize,
    pub output_dir: PathBuf,
}

/// Per-run checkpoint entry: `Some(row)` for a run that produced a
/// comparison row, `None` for a run that errored (isolated and skipped,
/// not retried on resume).
#[derive(Debug, Default, Serialize, Deserialize)]
struct Checkpoint {
    completed_runs: BTreeMap<String, Option<ComparisonRow>>,
}

impl Checkpoint {
    fn load(path: &std::path::Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    fn save(&self, path: &std::path::Path) -> Result<(), KernelError> {
        let raw = serde_json::to_string_pretty(self).map_err(|e| KernelError::input_validation(format!("serializing checkpoint.json: {e}")))?;
        std::fs::write(path, raw).map_err(|e| KernelError::input_validation(format!("writing checkpoint.json: {e}")))
    }
}

/// Runs one strategy across every combination of symbol sets and a
/// parameter grid, sequentially, isolating failures: a config that errors is
/// recorded and skipped rather than aborting the remaining configs.
/// Checkpoints progress to `checkpoint.json` so an interrupted grid can
/// resume without re-running completed configs.
pub struct GridSearchOrchestrator;

impl GridSearchOrchestrator {
    #[instrument(skip_all, fields(strategy = %grid_config.strategy))]
    #[allow(clippy::too_many_arguments)]
    pub fn run_all(
        registry: &StrategyRegistry,
        grid_config: &GridSearchConfig,
        bars_by_symbol: &HashMap<String, Vec<Bar>>,
        required_symbols: &[&str],
        backtest_config: &BacktestConfig,
        run_timestamp: DateTime<Utc>,
    ) -> Result<GridSearchSummary, KernelError> {
        let output_dir = backtest_config.output_dir.clone();
        std::fs::create_dir_all(&output_dir)
            .map_err(|e| KernelError::input_validation(format!("creating grid-search output directory: {e}")))?;

        // `base_config` carries the capital/commission every run in the grid
        // shares; it overrides whatever the caller's `backtest_config`
        // defaulted to, so a YAML `base_config` is the single source of truth
        // for those fields across the sweep.
        let mut backtest_config: BacktestConfig = backtest_config.clone();
        if let Some(base) = &grid_config.base_config {
            backtest_config.initial_capital = base.initial_capital;
            backtest_config.commission_per_share = base.commission;
        }
        let backtest_config = &backtest_config;

        let planned_runs = expand_runs(grid_config);
        if planned_runs.len() > grid_config.max_combinations && !grid_config.allow_large_grid {
            return Err(KernelError::configuration(format!(
                "grid expands to {} runs, exceeding max_combinations ({}); set allow_large_grid: true to proceed",
                planned_runs.len(),
                grid_config.max_combinations
            )));
        }

        let checkpoint_path = output_dir.join("checkpoint.json");
        let mut checkpoint = Checkpoint::load(&checkpoint_path);

        let mut rows = Vec::new();
        let baseline_symbol = grid_config.baseline_symbol.as_deref();
        if let Some(row) = baseline_row(baseline_symbol, bars_by_symbol) {
            rows.push(row);
        }

        let mut run_config_rows: Vec<(String, Option<String>, HashMap<String, String>)> = Vec::new();
        let mut successful = 0;
        let mut failed = 0;

        for (idx, run) in planned_runs.iter().enumerate() {
            let config_id = format!("{:03}", idx + 1);
            run_config_rows.push((config_id.clone(), run.symbol_set_name.clone(), run.params.clone()));

            if let Some(prior) = checkpoint.completed_runs.get(&config_id) {
                info!(config_id = %config_id, "restoring run already recorded in checkpoint.json");
                match prior {
                    Some(row) => {
                        rows.push(row.clone());
                        successful += 1;
                    }
                    None => failed += 1,
                }
                continue;
            }

            let run_required: Vec<&str> = if run.required_symbols.is_empty() {
                required_symbols.to_vec()
            } else {
                run.required_symbols.iter().map(String::as_str).collect()
            };

            let strategy = registry.create(&grid_config.strategy)?;
            let mut run_config = backtest_config.clone();
            run_config.output_dir = output_dir.join(format!("run_{config_id}"));

            match BacktestRunner::run(strategy, bars_by_symbol.clone(), &run_required, &run.params, &run_config, baseline_symbol, run_timestamp) {
                Ok(result) => {
                    successful += 1;
                    let row = ComparisonRow {
                        config_id: config_id.clone(),
                        strategy_name: grid_config.strategy.clone(),
                        params: format_params(&run.params),
                        total_return_pct: result.report.total_return_pct,
                        max_drawdown_pct: result.report.max_drawdown_pct,
                        sharpe_ratio: result.report.sharpe_ratio,
                        alpha: result.report.baseline.as_ref().and_then(|b| b.alpha),
                    };
                    rows.push(row.clone());
                    checkpoint.completed_runs.insert(config_id.clone(), Some(row));
                }
                Err(error) => {
                    failed += 1;
                    warn!(config_id = %config_id, %error, "grid-search configuration failed; skipping");
                    checkpoint.completed_runs.insert(config_id.clone(), None);
                }
            }

            if (idx + 1) % grid_config.checkpoint_interval == 0 {
                checkpoint.save(&checkpoint_path)?;
            }
        }
        checkpoint.save(&checkpoint_path)?;

        write_run_config_csv(&output_dir.join("run_config.csv"), &run_config_rows)?;
        csv_output::write_summary_comparison(&output_dir.join("summary_comparison.csv"), &rows)?;
        let mut param_names: Vec<String> = grid_config.parameters.keys().cloned().collect();
        param_names.sort();
        csv_output::write_grid_readme(&output_dir.join("README.txt"), &grid_config.strategy, &param_names, planned_runs.len(), failed)?;

        info!(successful, failed, total = planned_runs.len(), "grid search complete");

        Ok(GridSearchSummary { rows, successful, failed, output_dir })
    }
}

fn format_params(params: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = params.keys().collect();
    keys.sort();
    keys.into_iter().map(|k| format!("{k}={}", params[k])).collect::<Vec<_>>().join(";")
}

fn write_run_config_csv(path: &std::path::Path, rows: &[(String, Option<String>, HashMap<String, String>)]) -> Result<(), KernelError> {
    let mut param_names: BTreeSet<String> = BTreeSet::new();
    for (_, _, params) in rows {
        param_names.extend(params.keys().cloned());
    }
    let param_names: Vec<String> = param_names.into_iter().collect();

    let mut writer = csv::Writer::from_path(path).map_err(|e| KernelError::input_validation(format!("opening run_config.csv: {e}")))?;
    let mut header = vec!["config_id".to_string(), "symbol_set".to_string()];
    header.extend(param_names.iter().cloned());
    writer
        .write_record(&header)
        .map_err(|e| KernelError::input_validation(format!("writing run_config.csv header: {e}")))?;

    for (config_id, symbol_set_name, params) in rows {
        let mut row = vec![config_id.clone(), symbol_set_name.clone().unwrap_or_default()];
        for name in &param_names {
            row.push(params.get(name).cloned().unwrap_or_default());
        }
        writer
            .write_record(&row)
            .map_err(|e| KernelError::input_validation(format!("writing run_config.csv row: {e}")))?;
    }
    writer.flush().map_err(|e| KernelError::input_validation(format!("flushing run_config.csv: {e}")))
}

/// Row `000`: buy-and-hold on the baseline symbol over the same bars, with
/// no strategy and no alpha (it IS the benchmark every other row is
/// measured against).
fn baseline_row(baseline_symbol: Option<&str>, bars_by_symbol: &HashMap<String, Vec<Bar>>) -> Option<ComparisonRow> {
    let symbol = baseline_symbol?;
    let bars = bars_by_symbol.get(symbol)?;
    let first = bars.first()?;
    let last = bars.last()?;
    if first.close.is_zero() {
        return None;
    }
    let total_return_pct = (((last.close - first.close) / first.close) * Decimal::from(100)).to_f64().unwrap_or(0.0);

    let equity_curve: Vec<EquityPoint> = bars.iter().map(|b| EquityPoint::bare(b.timestamp, b.close)).collect();
    let max_drawdown_pct = PerformanceAnalyzer::compute(&equity_curve, &[], first.close, None, &AnalyzerConfig::default()).max_drawdown_pct;

    Some(ComparisonRow {
        config_id: "000".to_string(),
        strategy_name: "buy_and_hold_baseline".to_string(),
        params: String::new(),
        total_return_pct,
        max_drawdown_pct,
        sharpe_ratio: None,
        alpha: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_grid_is_the_cartesian_product() {
        let mut params = HashMap::new();
        params.insert("fast".to_string(), vec!["5".to_string(), "10".to_string()]);
        params.insert("slow".to_string(), vec!["20".to_string()]);
        let combos = expand_grid(&params);
        assert_eq!(combos.len(), 2);
        assert!(combos.iter().any(|c| c["fast"] == "5" && c["slow"] == "20"));
        assert!(combos.iter().any(|c| c["fast"] == "10" && c["slow"] == "20"));
    }

    #[test]
    fn expand_grid_with_no_parameters_yields_one_empty_combo() {
        let combos = expand_grid(&HashMap::new());
        assert_eq!(combos, vec![HashMap::new()]);
    }

    #[test]
    fn parses_yaml_grid_config_with_symbol_sets_and_base_config() {
        let yaml = "
strategy: sma_crossover
symbol_sets:
  - name: default
    signal_symbol: SPY
    bull_symbol: QQQ
    defense_symbol: TLT
base_config:
  start_date: '2020-01-01'
  end_date: '2020-12-31'
  timeframe: 1D
  initial_capital: 100000
  commission: 0.01
parameters:
  fast: [\"5\", \"10\"]
  slow: [\"20\"]
max_combinations: 500
checkpoint_interval: 10
";
        let config = GridSearchConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.strategy, "sma_crossover");
        assert_eq!(config.symbol_sets.len(), 1);
        assert_eq!(config.symbol_sets[0].bull_symbol, "QQQ");
        assert_eq!(config.base_config.unwrap().start_date, "2020-01-01");
        assert_eq!(config.max_combinations, 500);
        assert_eq!(config.checkpoint_interval, 10);
    }

    #[test]
    fn validate_requires_base_config() {
        let config = GridSearchConfig {
            strategy: "x".to_string(),
            symbol_sets: Vec::new(),
            base_config: None,
            parameters: HashMap::new(),
            baseline_symbol: None,
            max_combinations: 500,
            checkpoint_interval: 10,
            allow_large_grid: false,
        };
        assert!(config.validate(false).is_err());
    }

    #[test]
    fn validate_requires_vix_symbol_when_strategy_needs_it() {
        let mut config = GridSearchConfig {
            strategy: "vol_filtered".to_string(),
            symbol_sets: vec![SymbolSet {
                name: "default".to_string(),
                signal_symbol: "SPY".to_string(),
                bull_symbol: "QQQ".to_string(),
                defense_symbol: "TLT".to_string(),
                vix_symbol: None,
            }],
            base_config: Some(BaseConfig {
                start_date: "2020-01-01".to_string(),
                end_date: "2020-12-31".to_string(),
                timeframe: "1D".to_string(),
                initial_capital: Decimal::from(100_000),
                commission: Decimal::ZERO,
                slippage: Decimal::ZERO,
            }),
            parameters: HashMap::new(),
            baseline_symbol: None,
            max_combinations: 500,
            checkpoint_interval: 10,
            allow_large_grid: false,
        };
        assert!(config.validate(true).is_err());
        config.symbol_sets[0].vix_symbol = Some("$VIX".to_string());
        assert!(config.validate(true).is_ok());
    }

    #[test]
    fn expand_runs_folds_symbol_set_roles_into_params() {
        let mut parameters = HashMap::new();
        parameters.insert("fast".to_string(), vec!["5".to_string()]);
        let config = GridSearchConfig {
            strategy: "x".to_string(),
            symbol_sets: vec![SymbolSet {
                name: "default".to_string(),
                signal_symbol: "SPY".to_string(),
                bull_symbol: "QQQ".to_string(),
                defense_symbol: "TLT".to_string(),
                vix_symbol: None,
            }],
            base_config: None,
            parameters,
            baseline_symbol: None,
            max_combinations: 500,
            checkpoint_interval: 10,
            allow_large_grid: false,
        };
        let runs = expand_runs(&config);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].params.get("bull_symbol"), Some(&"QQQ".to_string()));
        assert_eq!(runs[0].required_symbols, vec!["SPY".to_string(), "QQQ".to_string(), "TLT".to_string()]);
    }

    #[test]
    fn checkpoint_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let mut checkpoint = Checkpoint::default();
        checkpoint.completed_runs.insert(
            "001".to_string(),
            Some(ComparisonRow {
                config_id: "001".to_string(),
                strategy_name: "x".to_string(),
                params: "fast=5".to_string(),
                total_return_pct: 12.5,
                max_drawdown_pct: -3.0,
                sharpe_ratio: Some(1.1),
                alpha: Some(0.2),
            }),
        );
        checkpoint.completed_runs.insert("002".to_string(), None);
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load(&path);
        let row = loaded.completed_runs.get("001").unwrap().as_ref().unwrap();
        assert_eq!(row.total_return_pct, 12.5);
        assert!(loaded.completed_runs.get("002").unwrap().is_none());
    }

    #[test]
    fn validate_rejects_zero_checkpoint_interval() {
        let config = GridSearchConfig {
            strategy: "x".to_string(),
            symbol_sets: Vec::new(),
            base_config: Some(BaseConfig {
                start_date: "2020-01-01".to_string(),
                end_date: "2020-12-31".to_string(),
                timeframe: "1D".to_string(),
                initial_capital: Decimal::from(100_000),
                commission: Decimal::ZERO,
                slippage: Decimal::ZERO,
            }),
            parameters: HashMap::new(),
            baseline_symbol: None,
            max_combinations: 500,
            checkpoint_interval: 0,
            allow_large_grid: false,
        };
        assert!(config.validate(false).is_err());
    }
}
