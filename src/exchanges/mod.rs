pub mod feeds;
pub mod parsers;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use feeds::ExchangeFeed;

/// Trade venue of the native coin.
///
/// `Bsc` is the on-chain pseudo-market that only appears in statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    Hotbit,
    Bitmart,
    Bsc,
    Vitex,
    Probit,
    Qtrade,
}

const POLLED_MARKETS: [Market; 4] = [Market::Hotbit, Market::Bitmart, Market::Vitex, Market::Probit];

impl Market {
    /// Markets with a live trade feed
    pub fn polled() -> &'static [Market] {
        &POLLED_MARKETS
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Hotbit => "hotbit",
            Market::Bitmart => "bitmart",
            Market::Bsc => "bsc",
            Market::Vitex => "vitex",
            Market::Probit => "probit",
            Market::Qtrade => "qtrade",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Market::Hotbit => "Hotbit",
            Market::Bitmart => "BitMart",
            Market::Bsc => "BSC",
            Market::Vitex => "ViteX",
            Market::Probit => "ProBit",
            Market::Qtrade => "qTrade",
        }
    }

    /// Price source id of the quote currency
    pub fn quote(&self) -> &'static str {
        match self {
            Market::Bitmart | Market::Bsc => "cg:tether",
            Market::Hotbit | Market::Vitex | Market::Probit | Market::Qtrade => "cg:bitcoin",
        }
    }

    pub fn link(&self) -> &'static str {
        match self {
            Market::Hotbit => "https://www.hotbit.io/exchange?symbol=IDNA_BTC",
            Market::Bitmart => "https://www.bitmart.com/trade/en?layout=basic&symbol=IDNA_USDT",
            Market::Bsc => "https://app.1inch.io/#/56/unified/swap/0x0de08c1abe5fb86dd7fd2ac90400ace305138d5b/BUSD",
            Market::Vitex => "https://x.vite.net/trade?symbol=IDNA-000_BTC-000",
            Market::Probit => "https://www.probit.com/app/exchange/IDNA-BTC",
            Market::Qtrade => "https://qtrade.io/market/IDNA_BTC",
        }
    }

    /// Public REST API root of the venue
    pub fn api_base(&self) -> Option<&'static str> {
        match self {
            Market::Hotbit => Some("https://api.hotbit.io"),
            Market::Bitmart => Some("https://api-cloud.bitmart.com"),
            Market::Vitex => Some("https://api.vitex.net"),
            Market::Probit => Some("https://api.probit.com"),
            Market::Bsc | Market::Qtrade => None,
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polled_markets_have_endpoints() {
        for market in Market::polled() {
            assert!(market.api_base().is_some(), "{} has no endpoint", market);
        }
        assert!(Market::Bsc.api_base().is_none());
    }

    #[test]
    fn test_quote_currencies() {
        assert_eq!(Market::Bitmart.quote(), "cg:tether");
        assert_eq!(Market::Probit.quote(), "cg:bitcoin");
        assert_eq!(serde_json::to_string(&Market::Vitex).unwrap(), "\"vitex\"");
    }
}
