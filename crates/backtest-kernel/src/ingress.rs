use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::warn;

/// Index and volatility symbols are commonly quoted without their exchange
/// prefix in raw feeds (`VIX`, `SPX`) but referred to with a `$` sigil
/// everywhere else in this codebase (`$VIX`) to keep them visually distinct
/// from tradable tickers in logs and CSVs. Idempotent: already-prefixed
/// symbols pass through unchanged.
pub fn normalize_index_symbol(symbol: &str) -> String {
    const KNOWN_INDEX_SYMBOLS: &[&str] = &["VIX", "SPX", "NDX", "RUT", "DJI"];
    if symbol.starts_with('$') {
        return symbol.to_string();
    }
    if KNOWN_INDEX_SYMBOLS.contains(&symbol) {
        format!("${symbol}")
    } else {
        symbol.to_string()
    }
}

/// Reads an environment variable and parses it as a `Decimal`, falling back
/// to `default` (with a warning) if the variable is unset or unparseable.
pub fn parse_env_decimal(key: &str, default: Decimal) -> Decimal {
    match std::env::var(key) {
        Ok(raw) => Decimal::from_str(raw.trim()).unwrap_or_else(|e| {
            warn!(key, value = %raw, error = %e, "could not parse env var as Decimal; using default");
            default
        }),
        Err(_) => default,
    }
}

/// Same as `parse_env_decimal`, for the handful of inputs (e.g. annualization
/// factors, confidence levels) that are naturally `f64` rather than exact
/// money amounts.
pub fn parse_env_f64(key: &str, default: f64) -> f64 {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<f64>().unwrap_or_else(|e| {
            warn!(key, value = %raw, error = %e, "could not parse env var as f64; using default");
            default
        }),
        Err(_) => default,
    }
}
