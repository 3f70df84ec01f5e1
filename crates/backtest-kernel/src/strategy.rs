use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::KernelError;
use crate::types::{Bar, Side, Signal, StrategyContextRecord};

/// A trading strategy. Implementations hold whatever indicator state they
/// need between bars; the kernel never inspects it.
///
/// `Strategy` is `Send` (the grid-search orchestrator runs strategy
/// instances on a worker pool) but deliberately not `Sync` — a strategy's
/// `&mut self` methods are never called concurrently from more than one
/// place, so there is nothing to synchronize.
pub trait Strategy: Send {
    /// One-time setup from the run's string-keyed parameter map (as decoded
    /// from a grid-search YAML cell). Default is a no-op for strategies with
    /// no configurable parameters.
    fn init(&mut self, _params: &HashMap<String, String>) -> Result<(), KernelError> {
        Ok(())
    }

    /// Called once per bar in chronological order. Any signals the strategy
    /// wants to emit are queued via `ctx.buy`/`ctx.sell`; the kernel drains
    /// the queue after this call returns.
    fn on_bar(&mut self, ctx: &mut StrategyContext);

    /// Stable identifier used for log correlation and artifact directory
    /// naming (`{name}_{timestamp}/`).
    fn name(&self) -> &str;
}

/// The per-bar working surface a strategy is handed. Owns the signal queue,
/// a bounded per-symbol bar-history buffer, and a read-only snapshot of
/// portfolio state; none of it is visible to `on_bar` until the kernel
/// populates it for the current tick.
///
/// Bar history is indexed per symbol rather than filtered on demand out of a
/// single flat buffer: `get_closes(symbol, lookback)` is `O(lookback)`, not
/// `O(bars seen so far)`.
pub struct StrategyContext {
    max_history: usize,
    bar_history: HashMap<String, VecDeque<Bar>>,
    known_symbols: HashSet<String>,
    current_bar_number: u64,
    current_timestamp: DateTime<Utc>,
    positions: HashMap<String, i64>,
    cash: Decimal,
    total_value: Decimal,
    signals: Vec<Signal>,
    pending_context: Vec<StrategyContextRecord>,
}

impl StrategyContext {
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history,
            bar_history: HashMap::new(),
            known_symbols: HashSet::new(),
            current_bar_number: 0,
            current_timestamp: DateTime::<Utc>::default(),
            positions: HashMap::new(),
            cash: Decimal::ZERO,
            total_value: Decimal::ZERO,
            signals: Vec::new(),
            pending_context: Vec::new(),
        }
    }

    /// Advance to a new tick: update the clock and observe every bar seen on
    /// it. Called by the event loop before `on_bar`.
    pub fn begin_tick(&mut self, bar_number: u64, timestamp: DateTime<Utc>, bars: &[&Bar]) {
        self.current_bar_number = bar_number;
        self.current_timestamp = timestamp;
        for bar in bars {
            self.known_symbols.insert(bar.symbol.clone());
            let buffer = self.bar_history.entry(bar.symbol.clone()).or_default();
            buffer.push_back((*bar).clone());
            while buffer.len() > self.max_history {
                buffer.pop_front();
            }
        }
    }

    /// Replace the position/cash/total-value snapshot `on_bar` will read.
    /// Called by the event loop right before `on_bar`, using values from the
    /// portfolio after that tick's market-value update.
    pub fn set_snapshot(&mut self, positions: HashMap<String, i64>, cash: Decimal, total_value: Decimal) {
        self.positions = positions;
        self.cash = cash;
        self.total_value = total_value;
    }

    pub fn current_bar_number(&self) -> u64 {
        self.current_bar_number
    }

    pub fn current_timestamp(&self) -> DateTime<Utc> {
        self.current_timestamp
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn total_value(&self) -> Decimal {
        self.total_value
    }

    /// Closing prices for `symbol`, oldest first, at most `lookback` of the
    /// most recent observed. Shorter than `lookback` if history is thin.
    pub fn get_closes(&self, symbol: &str, lookback: usize) -> Vec<Decimal> {
        self.tail_field(symbol, lookback, |bar| bar.close)
    }

    pub fn get_highs(&self, symbol: &str, lookback: usize) -> Vec<Decimal> {
        self.tail_field(symbol, lookback, |bar| bar.high)
    }

    pub fn get_lows(&self, symbol: &str, lookback: usize) -> Vec<Decimal> {
        self.tail_field(symbol, lookback, |bar| bar.low)
    }

    fn tail_field(&self, symbol: &str, lookback: usize, extract: impl Fn(&Bar) -> Decimal) -> Vec<Decimal> {
        let Some(buffer) = self.bar_history.get(symbol) else {
            return Vec::new();
        };
        let skip = buffer.len().saturating_sub(lookback);
        buffer.iter().skip(skip).map(extract).collect()
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.get_position(symbol) != 0
    }

    pub fn get_position(&self, symbol: &str) -> i64 {
        self.positions.get(symbol).copied().unwrap_or(0)
    }

    /// Queue a buy signal at the given fraction of total portfolio value.
    /// `0.0` is the universal liquidation idiom regardless of current side.
    pub fn buy(&mut self, symbol: impl Into<String>, portfolio_percent: Decimal) {
        self.signals.push(Signal::new(symbol, Side::Buy, self.current_timestamp, portfolio_percent));
    }

    pub fn sell(&mut self, symbol: impl Into<String>, portfolio_percent: Decimal) {
        self.signals.push(Signal::new(symbol, Side::Sell, self.current_timestamp, portfolio_percent));
    }

    /// Like `buy`, but sizes via `floor(allocation_dollars / risk_per_share)`
    /// instead of the price-based formula (an ATR-stop sizing scheme).
    pub fn buy_with_risk(&mut self, symbol: impl Into<String>, portfolio_percent: Decimal, risk_per_share: Decimal) {
        let mut signal = Signal::new(symbol, Side::Buy, self.current_timestamp, portfolio_percent);
        signal.risk_per_share = Some(risk_per_share);
        self.signals.push(signal);
    }

    pub fn sell_with_risk(&mut self, symbol: impl Into<String>, portfolio_percent: Decimal, risk_per_share: Decimal) {
        let mut signal = Signal::new(symbol, Side::Sell, self.current_timestamp, portfolio_percent);
        signal.risk_per_share = Some(risk_per_share);
        self.signals.push(signal);
    }

    /// Record the reasoning behind an (upcoming, or just-emitted) signal for
    /// later correlation with its fill in the trade log.
    #[allow(clippy::too_many_arguments)]
    pub fn log_strategy_context(
        &mut self,
        symbol: impl Into<String>,
        state_label: impl Into<String>,
        decision_reason: impl Into<String>,
        indicators: HashMap<String, Decimal>,
        thresholds: HashMap<String, Decimal>,
    ) {
        self.pending_context.push(StrategyContextRecord {
            timestamp: self.current_timestamp,
            symbol: symbol.into(),
            bar_number: self.current_bar_number,
            state_label: state_label.into(),
            decision_reason: decision_reason.into(),
            indicators,
            thresholds,
        });
    }

    /// Assert that bars for every named symbol have been observed at least
    /// once so far. Not called automatically; multi-symbol strategies (e.g.
    /// ones that gate entries on a signal asset like `$VIX`) call this
    /// explicitly at the top of `on_bar` to fail fast and clearly instead of
    /// reading an empty history buffer.
    pub fn require_symbols(&self, needed: &[&str]) -> Result<(), KernelError> {
        let missing: Vec<&str> = needed.iter().copied().filter(|symbol| !self.known_symbols.contains(*symbol)).collect();
        if missing.is_empty() {
            return Ok(());
        }
        let mut observed: Vec<&str> = self.known_symbols.iter().map(String::as_str).collect();
        observed.sort_unstable();
        Err(KernelError::input_validation(format!(
            "missing required symbols: [{}]; observed so far: [{}]",
            missing.join(", "),
            observed.join(", ")
        )))
    }

    pub(crate) fn drain_signals(&mut self) -> Vec<Signal> {
        std::mem::take(&mut self.signals)
    }

    pub(crate) fn drain_context_records(&mut self) -> Vec<StrategyContextRecord> {
        std::mem::take(&mut self.pending_context)
    }
}

impl Strategy for Box<dyn Strategy> {
    fn init(&mut self, params: &HashMap<String, String>) -> Result<(), KernelError> {
        (**self).init(params)
    }

    fn on_bar(&mut self, ctx: &mut StrategyContext) {
        (**self).on_bar(ctx)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Builds a fresh strategy instance by name. Implemented once per strategy
/// type and registered with a `StrategyRegistry`.
pub trait StrategyFactory: Send + Sync {
    fn name(&self) -> &str;
    fn create(&self) -> Box<dyn Strategy>;
}

/// Maps strategy names (as they appear in grid-search YAML) to factories.
/// Replaces dynamic import-by-string-name: every strategy a run can select
/// must be registered here at startup, so an unknown name fails fast with a
/// clear `Configuration` error instead of a runtime lookup into arbitrary
/// code.
#[derive(Default)]
pub struct StrategyRegistry {
    factories: HashMap<String, Box<dyn StrategyFactory>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    pub fn register(&mut self, factory: Box<dyn StrategyFactory>) {
        self.factories.insert(factory.name().to_string(), factory);
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Strategy>, KernelError> {
        self.factories
            .get(name)
            .map(|factory| factory.create())
            .ok_or_else(|| KernelError::configuration(format!("unknown strategy: {name}")))
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(symbol: &str, ts: &str, close: i64) -> Bar {
        let c = Decimal::from(close);
        Bar {
            symbol: symbol.to_string(),
            timestamp: ts.parse().unwrap(),
            open: c,
            high: c,
            low: c,
            close: c,
            volume: Decimal::from(1000),
        }
    }

    #[test]
    fn get_closes_returns_at_most_lookback_oldest_first() {
        let mut ctx = StrategyContext::new(5);
        for day in 1..=3 {
            let b = bar("X", &format!("2024-01-0{day}T00:00:00Z"), day);
            ctx.begin_tick(day as u64, b.timestamp, &[&b]);
        }
        assert_eq!(ctx.get_closes("X", 10), vec![Decimal::from(1), Decimal::from(2), Decimal::from(3)]);
        assert_eq!(ctx.get_closes("X", 2), vec![Decimal::from(2), Decimal::from(3)]);
    }

    #[test]
    fn history_buffer_is_bounded_by_max_history() {
        let mut ctx = StrategyContext::new(2);
        for day in 1..=5 {
            let b = bar("X", &format!("2024-01-0{day}T00:00:00Z"), day);
            ctx.begin_tick(day as u64, b.timestamp, &[&b]);
        }
        assert_eq!(ctx.get_closes("X", 10), vec![Decimal::from(4), Decimal::from(5)]);
    }

    #[test]
    fn require_symbols_fails_until_a_bar_is_observed() {
        let mut ctx = StrategyContext::new(5);
        assert!(ctx.require_symbols(&["X"]).is_err());
        let b = bar("X", "2024-01-01T00:00:00Z", 10);
        ctx.begin_tick(1, b.timestamp, &[&b]);
        assert!(ctx.require_symbols(&["X"]).is_ok());
        assert!(ctx.require_symbols(&["Y"]).is_err());
    }

    #[test]
    fn require_symbols_reports_every_missing_symbol_and_the_observed_set() {
        let mut ctx = StrategyContext::new(5);
        let b = bar("X", "2024-01-01T00:00:00Z", 10);
        ctx.begin_tick(1, b.timestamp, &[&b]);

        let err = ctx.require_symbols(&["Y", "Z", "X"]).unwrap_err();
        assert!(matches!(err, KernelError::InputValidation(_)));
        let message = err.to_string();
        assert!(message.contains('Y'));
        assert!(message.contains('Z'));
        assert!(message.contains("observed so far: [X]"));
    }

    #[test]
    fn buy_and_sell_queue_signals_drained_exactly_once() {
        let mut ctx = StrategyContext::new(5);
        let b = bar("X", "2024-01-01T00:00:00Z", 10);
        ctx.begin_tick(1, b.timestamp, &[&b]);
        ctx.buy("X", Decimal::new(5, 1));
        ctx.sell("Y", Decimal::ZERO);
        let drained = ctx.drain_signals();
        assert_eq!(drained.len(), 2);
        assert!(ctx.drain_signals().is_empty());
    }

    #[test]
    fn registry_rejects_unknown_strategy_name() {
        let registry = StrategyRegistry::new();
        assert!(registry.create("nope").is_err());
    }
}
