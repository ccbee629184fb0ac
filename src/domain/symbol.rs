use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical `BASE/QUOTE` symbol. This is the only form that appears in
/// `StateManager`, `CandleStore` and `SignalEngine`; every adapter owns a
/// bidirectional mapping between this and its venue-specific spelling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(base: &str, quote: &str) -> Self {
        Symbol(format!("{}/{}", base.to_ascii_uppercase(), quote.to_ascii_uppercase()))
    }

    pub fn parse(canonical: &str) -> Result<Self, String> {
        let upper = canonical.to_ascii_uppercase();
        let mut parts = upper.split('/');
        let base = parts.next().filter(|s| !s.is_empty());
        let quote = parts.next().filter(|s| !s.is_empty());
        if parts.next().is_some() || base.is_none() || quote.is_none() {
            return Err(format!("not a canonical BASE/QUOTE symbol: '{canonical}'"));
        }
        Ok(Symbol(upper))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn base(&self) -> &str {
        self.0.split('/').next().unwrap_or("")
    }

    pub fn quote(&self) -> &str {
        self.0.split('/').nth(1).unwrap_or("")
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bidirectional mapping between canonical symbols and a venue's own
/// spelling (e.g. `XXBTZUSD`, `btcusd`, `BTC-USD`).
pub trait SymbolMap: Send + Sync {
    fn to_venue(&self, symbol: &Symbol) -> Option<String>;
    fn from_venue(&self, venue_symbol: &str) -> Option<Symbol>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_canonical_form() {
        let s = Symbol::parse("btc/usd").unwrap();
        assert_eq!(s.as_str(), "BTC/USD");
        assert_eq!(s.base(), "BTC");
        assert_eq!(s.quote(), "USD");
    }

    #[test]
    fn parse_rejects_malformed_symbols() {
        assert!(Symbol::parse("BTCUSD").is_err());
        assert!(Symbol::parse("BTC/USD/EXTRA").is_err());
        assert!(Symbol::parse("/USD").is_err());
        assert!(Symbol::parse("BTC/").is_err());
    }

    #[test]
    fn new_uppercases_and_joins() {
        assert_eq!(Symbol::new("eth", "usdt").as_str(), "ETH/USDT");
    }
}
