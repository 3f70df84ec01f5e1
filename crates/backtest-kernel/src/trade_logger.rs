use std::collections::HashMap;

use chrono::Duration;
use rust_decimal::Decimal;
use tracing::trace;

use crate::types::{Fill, PortfolioSnapshot, StrategyContextRecord, TradeRecord, UNKNOWN_STATE_LABEL};

/// Two fills on the same symbol rarely land on the exact same tick as the
/// `log_strategy_context` call that motivated them (context is logged inside
/// `on_bar`, the fill happens when the portfolio processes the resulting
/// signal), so correlation is done by proximity rather than exact match.
const CORRELATION_WINDOW_SECONDS: i64 = 60;

/// How many uncorrelated context records to retain per symbol before the
/// oldest is dropped. Bounds memory for strategies that log context far more
/// often than they actually trade.
const MAX_CONTEXT_PER_SYMBOL: usize = 64;

/// Joins strategy-side decision context with portfolio-side fills into a
/// single append-only `TradeRecord` stream, numbered sequentially.
///
/// This is a two-phase correlation: `log_strategy_context` is called from
/// inside a strategy's `on_bar`, before a signal is even sized by the
/// portfolio; `log_trade_execution` is called by the portfolio once a fill
/// exists. The logger reconciles the two by symbol and a short time window,
/// falling back to an `Unknown` context when no strategy ever logged one
/// (the strategy didn't call `log_strategy_context`, or nothing matched
/// within the window).
pub struct TradeLogger {
    next_trade_id: u64,
    pending_context: HashMap<String, Vec<StrategyContextRecord>>,
    records: Vec<TradeRecord>,
}

impl TradeLogger {
    pub fn new() -> Self {
        Self {
            next_trade_id: 1,
            pending_context: HashMap::new(),
            records: Vec::new(),
        }
    }

    /// Record a strategy's decision context ahead of a possible signal.
    /// Cheap and safe to call on every bar, whether or not a signal follows.
    pub fn log_strategy_context(&mut self, record: StrategyContextRecord) {
        let bucket = self.pending_context.entry(record.symbol.clone()).or_default();
        bucket.push(record);
        if bucket.len() > MAX_CONTEXT_PER_SYMBOL {
            bucket.remove(0);
        }
    }

    /// Record a fill, correlating it against any pending strategy context for
    /// the same symbol within the correlation window. Consumes the matched
    /// context record (and anything older for that symbol) so a single
    /// `log_strategy_context` call cannot be matched to two trades.
    pub fn log_trade_execution(
        &mut self,
        fill: Fill,
        bar_number: u64,
        before: PortfolioSnapshot,
        after: PortfolioSnapshot,
        initial_capital: Decimal,
    ) -> u64 {
        let trade_id = self.next_trade_id;
        self.next_trade_id += 1;

        let context = self.take_matching_context(&fill);
        let (state_label, decision_reason, indicators, thresholds) = match context {
            Some(ctx) => (ctx.state_label, ctx.decision_reason, ctx.indicators, ctx.thresholds),
            None => {
                trace!(symbol = %fill.symbol, trade_id, "no strategy context correlated with this fill");
                (UNKNOWN_STATE_LABEL.to_string(), String::new(), HashMap::new(), HashMap::new())
            }
        };

        let cumulative_return_pct = if initial_capital != Decimal::ZERO {
            after.total_value / initial_capital - Decimal::ONE
        } else {
            Decimal::ZERO
        };

        let record = TradeRecord {
            trade_id,
            fill,
            bar_number,
            state_label,
            decision_reason,
            indicators,
            thresholds,
            before,
            after,
            cumulative_return_pct,
        };
        self.records.push(record);
        trade_id
    }

    /// Find the most recent pending context for this fill's symbol within
    /// the correlation window, remove it (and any stale entries older than
    /// the window) from the pending buffer, and return it.
    fn take_matching_context(&mut self, fill: &Fill) -> Option<StrategyContextRecord> {
        let bucket = self.pending_context.get_mut(&fill.symbol)?;
        let window = Duration::seconds(CORRELATION_WINDOW_SECONDS);

        let mut best_idx: Option<usize> = None;
        for (idx, ctx) in bucket.iter().enumerate() {
            if ctx.timestamp > fill.timestamp {
                continue;
            }
            if fill.timestamp - ctx.timestamp > window {
                continue;
            }
            best_idx = match best_idx {
                None => Some(idx),
                Some(current) if ctx.timestamp > bucket[current].timestamp => Some(idx),
                Some(current) => Some(current),
            };
        }

        let matched = best_idx.map(|idx| bucket.remove(idx));
        bucket.retain(|ctx| fill.timestamp - ctx.timestamp <= window);
        matched
    }

    pub fn records(&self) -> &[TradeRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<TradeRecord> {
        self.records
    }
}

impl Default for TradeLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use crate::types::{Side};

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn fill_at(symbol: &str, t: DateTime<Utc>) -> Fill {
        Fill {
            symbol: symbol.to_string(),
            direction: Side::Buy,
            quantity: 10,
            fill_price: Decimal::from(100),
            commission: Decimal::ZERO,
            timestamp: t,
        }
    }

    fn snapshot(value: i64) -> PortfolioSnapshot {
        PortfolioSnapshot {
            total_value: Decimal::from(value),
            cash: Decimal::from(value),
            allocations: HashMap::new(),
        }
    }

    fn context_at(symbol: &str, t: DateTime<Utc>, label: &str) -> StrategyContextRecord {
        StrategyContextRecord {
            timestamp: t,
            symbol: symbol.to_string(),
            bar_number: 1,
            state_label: label.to_string(),
            decision_reason: "test".to_string(),
            indicators: HashMap::new(),
            thresholds: HashMap::new(),
        }
    }

    #[test]
    fn correlates_context_logged_just_before_the_fill() {
        let mut logger = TradeLogger::new();
        let t = ts("2024-01-01T00:00:10Z");
        logger.log_strategy_context(context_at("X", t, "Breakout"));

        let fill_time = ts("2024-01-01T00:00:40Z");
        let id = logger.log_trade_execution(
            fill_at("X", fill_time),
            1,
            snapshot(1000),
            snapshot(1000),
            Decimal::from(1000),
        );
        assert_eq!(id, 1);
        assert_eq!(logger.records()[0].state_label, "Breakout");
    }

    #[test]
    fn falls_back_to_unknown_outside_the_window() {
        let mut logger = TradeLogger::new();
        logger.log_strategy_context(context_at("X", ts("2024-01-01T00:00:00Z"), "Breakout"));

        let fill_time = ts("2024-01-01T00:05:00Z"); // 5 minutes later, outside 60s window
        logger.log_trade_execution(fill_at("X", fill_time), 1, snapshot(1000), snapshot(1000), Decimal::from(1000));
        assert_eq!(logger.records()[0].state_label, UNKNOWN_STATE_LABEL);
    }

    #[test]
    fn falls_back_to_unknown_when_nothing_was_ever_logged() {
        let mut logger = TradeLogger::new();
        logger.log_trade_execution(
            fill_at("X", ts("2024-01-01T00:00:00Z")),
            1,
            snapshot(1000),
            snapshot(1000),
            Decimal::from(1000),
        );
        assert_eq!(logger.records()[0].state_label, UNKNOWN_STATE_LABEL);
    }

    #[test]
    fn trade_ids_are_sequential_and_stable() {
        let mut logger = TradeLogger::new();
        for i in 0..3 {
            let t = ts("2024-01-01T00:00:00Z") + Duration::days(i);
            logger.log_trade_execution(fill_at("X", t), i as u64, snapshot(1000), snapshot(1000), Decimal::from(1000));
        }
        let ids: Vec<u64> = logger.records().iter().map(|r| r.trade_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn a_context_record_is_consumed_by_at_most_one_trade() {
        let mut logger = TradeLogger::new();
        logger.log_strategy_context(context_at("X", ts("2024-01-01T00:00:00Z"), "Breakout"));

        logger.log_trade_execution(
            fill_at("X", ts("2024-01-01T00:00:10Z")),
            1,
            snapshot(1000),
            snapshot(1000),
            Decimal::from(1000),
        );
        logger.log_trade_execution(
            fill_at("X", ts("2024-01-01T00:00:20Z")),
            2,
            snapshot(1000),
            snapshot(1000),
            Decimal::from(1000),
        );
        assert_eq!(logger.records()[0].state_label, "Breakout");
        assert_eq!(logger.records()[1].state_label, UNKNOWN_STATE_LABEL);
    }

    #[test]
    fn cumulative_return_is_measured_against_initial_capital() {
        let mut logger = TradeLogger::new();
        logger.log_trade_execution(
            fill_at("X", ts("2024-01-01T00:00:00Z")),
            1,
            snapshot(1000),
            snapshot(1100),
            Decimal::from(1000),
        );
        assert_eq!(logger.records()[0].cumulative_return_pct, Decimal::new(1, 1));
    }
}
