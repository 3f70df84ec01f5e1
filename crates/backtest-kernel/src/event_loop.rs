use std::panic::AssertUnwindSafe;

use tracing::{error, instrument, trace};

use crate::error::KernelError;
use crate::feed::MergedBarFeed;
use crate::portfolio::{ExecuteSignalError, Portfolio};
use crate::strategy::{Strategy, StrategyContext};
use crate::trade_logger::TradeLogger;
use crate::types::{EquityPoint, TradeRecord};

/// Result of driving a feed to completion.
pub enum RunOutcome {
    Completed { equity_curve: Vec<EquityPoint>, trades: Vec<TradeRecord> },
    Failed { error: KernelError, equity_curve_so_far: Vec<EquityPoint>, trades_so_far: Vec<TradeRecord> },
}

/// Drives a `MergedBarFeed` through a `Strategy` and a `Portfolio`,
/// bar-by-bar, recording fills and equity as it goes.
///
/// Every bar is processed through the same fixed sequence: mark the
/// portfolio to the bar's close, refresh the strategy's view of history and
/// position state, run the strategy, log whatever context it recorded,
/// execute whatever signals it emitted, then record one equity-curve point.
/// That ordering is what makes two runs over the same feed produce bit-for-
/// bit identical output.
pub struct EventLoop<S: Strategy> {
    feed: MergedBarFeed,
    strategy: S,
    portfolio: Portfolio,
    trade_logger: TradeLogger,
    ctx: StrategyContext,
    bar_number: u64,
}

impl<S: Strategy> EventLoop<S> {
    pub fn new(feed: MergedBarFeed, strategy: S, portfolio: Portfolio, max_history: usize) -> Self {
        Self {
            feed,
            strategy,
            portfolio,
            trade_logger: TradeLogger::new(),
            ctx: StrategyContext::new(max_history),
            bar_number: 0,
        }
    }

    #[instrument(skip_all, fields(strategy = %self.strategy.name()))]
    pub fn run(mut self) -> RunOutcome {
        let mut equity_curve = Vec::new();

        while let Some(bar) = self.feed.next() {
            self.bar_number += 1;
            trace!(bar_number = self.bar_number, symbol = %bar.symbol, timestamp = %bar.timestamp, "processing bar");

            self.portfolio.update_market_value(&[&bar]);
            self.ctx.begin_tick(self.bar_number, bar.timestamp, &[&bar]);
            self.ctx.set_snapshot(
                self.portfolio.positions().clone(),
                self.portfolio.cash(),
                self.portfolio.total_value(),
            );

            let strategy = &mut self.strategy;
            let ctx = &mut self.ctx;
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| strategy.on_bar(ctx)));
            if let Err(panic_payload) = outcome {
                let message = panic_message(&panic_payload);
                let error = KernelError::Strategy {
                    symbol: bar.symbol.clone(),
                    timestamp: bar.timestamp,
                    source: anyhow::anyhow!(message),
                };
                error!(symbol = %bar.symbol, timestamp = %bar.timestamp, "strategy panicked; aborting run");
                return RunOutcome::Failed {
                    error,
                    equity_curve_so_far: equity_curve,
                    trades_so_far: self.trade_logger.into_records(),
                };
            }

            for record in self.ctx.drain_context_records() {
                self.trade_logger.log_strategy_context(record);
            }

            for signal in self.ctx.drain_signals() {
                match self.portfolio.execute_signal(&signal, &bar, self.bar_number, Some(&mut self.trade_logger)) {
                    Ok(_) => {}
                    Err(ExecuteSignalError::Rejected(reason)) => {
                        trace!(symbol = %signal.symbol, %reason, "signal rejected");
                    }
                    Err(ExecuteSignalError::InvalidSignal(error)) => {
                        error!(symbol = %signal.symbol, %error, "invalid signal; aborting run");
                        return RunOutcome::Failed {
                            error,
                            equity_curve_so_far: equity_curve,
                            trades_so_far: self.trade_logger.into_records(),
                        };
                    }
                }
            }

            equity_curve.push(EquityPoint {
                timestamp: bar.timestamp,
                total_value: self.portfolio.total_value(),
                cash: self.portfolio.cash(),
                positions: self.portfolio.positions().clone(),
                latest_prices: self.portfolio.latest_prices().clone(),
            });
        }

        RunOutcome::Completed { equity_curve, trades: self.trade_logger.into_records() }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "strategy panicked with a non-string payload".to_string()
    }
}
