use std::collections::{HashMap, VecDeque};

use crate::error::KernelError;
use crate::types::Bar;

/// Merges one or more per-symbol ordered bar sequences into a single
/// chronologically ordered stream.
///
/// Contract: yields bars with non-decreasing `timestamp`; ties are broken by
/// ascending `symbol`. Finite, single-pass, not restartable — once a bar is
/// yielded it cannot be replayed. Index symbols (e.g. `$VIX`) are carried
/// through unchanged; this adapter does no symbol rewriting.
pub struct MergedBarFeed {
    queues: Vec<(String, VecDeque<Bar>)>,
}

impl MergedBarFeed {
    /// Build a merged feed from one chronological bar sequence per symbol.
    ///
    /// `required_symbols` names every symbol the caller expects to trade or
    /// observe; any named symbol absent from `bars_by_symbol` or present with
    /// zero bars fails construction with `DataUnavailable`.
    pub fn new(
        bars_by_symbol: HashMap<String, Vec<Bar>>,
        required_symbols: &[&str],
    ) -> Result<Self, KernelError> {
        for symbol in required_symbols {
            let count = bars_by_symbol.get(*symbol).map(|v| v.len()).unwrap_or(0);
            if count == 0 {
                return Err(KernelError::data_unavailable(format!(
                    "symbol {symbol} has zero bars in the requested range"
                )));
            }
        }

        let mut queues = Vec::with_capacity(bars_by_symbol.len());
        for (symbol, bars) in bars_by_symbol {
            for window in bars.windows(2) {
                if window[1].timestamp < window[0].timestamp {
                    return Err(KernelError::input_validation(format!(
                        "bar sequence for {symbol} is not chronological: {} precedes {}",
                        window[0].timestamp, window[1].timestamp
                    )));
                }
            }
            for bar in &bars {
                bar.validate()?;
            }
            queues.push((symbol, VecDeque::from(bars)));
        }
        queues.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(Self { queues })
    }

    /// Number of symbols still carrying unyielded bars.
    pub fn remaining_symbols(&self) -> usize {
        self.queues.iter().filter(|(_, q)| !q.is_empty()).count()
    }
}

impl Iterator for MergedBarFeed {
    type Item = Bar;

    fn next(&mut self) -> Option<Bar> {
        let mut best: Option<usize> = None;
        for (idx, (_, queue)) in self.queues.iter().enumerate() {
            let Some(candidate) = queue.front() else {
                continue;
            };
            best = match best {
                None => Some(idx),
                Some(current_idx) => {
                    let current = self.queues[current_idx].1.front().unwrap();
                    if candidate.timestamp < current.timestamp
                        || (candidate.timestamp == current.timestamp
                            && self.queues[idx].0 < self.queues[current_idx].0)
                    {
                        Some(idx)
                    } else {
                        Some(current_idx)
                    }
                }
            };
        }
        best.and_then(|idx| self.queues[idx].1.pop_front())
    }
}
