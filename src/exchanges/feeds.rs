use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::mpsc;

use super::parsers::{convert_all, BitmartResponse, HotbitResponse, ProbitResponse, VitexResponse};
use super::Market;
use crate::error::{ConfigError, IndexerError, ProcessingError, RpcError};
use crate::logging::{LogContext, MetricsLogger, PerformanceMonitor};
use crate::models::{PriceBook, Trade};
use crate::shutdown::ShutdownSignal;

/// Where the next poll starts
#[derive(Debug, Clone, PartialEq)]
enum Cursor {
    /// Hotbit returns trades after an id
    LastId(i64),
    /// Millisecond trade time, newer trades are kept client-side
    After(i64),
    /// Probit takes a start time
    Since(DateTime<Utc>),
}

/// Polls one exchange's public trade endpoint and forwards new trades
pub struct ExchangeFeed {
    market: Market,
    client: Client,
    base_url: String,
    interval: Duration,
    prices: PriceBook,
    cursor: Cursor,
}

impl ExchangeFeed {
    pub fn new(market: Market, interval: Duration, prices: PriceBook, timeout: Duration) -> Result<Self, IndexerError> {
        let base_url = market.api_base().ok_or_else(|| {
            IndexerError::Config(ConfigError::InvalidValue {
                key: "exchanges.markets".to_string(),
                value: market.to_string(),
            })
        })?;
        let client = Client::builder().timeout(timeout).build().map_err(RpcError::Http)?;

        let cursor = match market {
            Market::Hotbit => Cursor::LastId(1),
            Market::Probit => Cursor::Since(Utc::now() - ChronoDuration::days(7)),
            _ => Cursor::After(0),
        };

        Ok(Self {
            market,
            client,
            base_url: base_url.to_string(),
            interval,
            prices,
            cursor,
        })
    }

    /// Points the feed at a different API root
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn market(&self) -> Market {
        self.market
    }

    /// ViteX rate-limits harder than the others
    pub fn poll_interval(&self) -> Duration {
        match self.market {
            Market::Vitex => self.interval * 3,
            _ => self.interval,
        }
    }

    fn quote_price(&self) -> Result<Decimal, IndexerError> {
        let quote = self.market.quote();
        self.prices
            .get(quote)
            .ok_or_else(|| IndexerError::Processing(ProcessingError::UnknownToken(quote.to_string())))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, IndexerError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                IndexerError::Rpc(RpcError::Timeout { seconds: 10 })
            } else if e.is_connect() {
                IndexerError::Rpc(RpcError::Connection(e.to_string()))
            } else {
                IndexerError::Rpc(RpcError::Http(e))
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(IndexerError::Rpc(RpcError::RateLimit { seconds: 60 }));
        }
        if !status.is_success() {
            return Err(IndexerError::Rpc(RpcError::Connection(format!("HTTP error: {}", status.as_u16()))));
        }

        let body = response.bytes().await.map_err(RpcError::Http)?;
        serde_json::from_slice(&body).map_err(|e| IndexerError::Rpc(RpcError::Json(e)))
    }

    /// Fetches trades newer than the cursor and advances it
    pub async fn poll(&mut self) -> Result<Vec<Trade>, IndexerError> {
        let monitor = PerformanceMonitor::new("exchange_poll")
            .with_metadata("market", serde_json::json!(self.market.as_str()));
        let result = self.fetch().await;
        let duration = monitor.finish_with_result(&result);
        MetricsLogger::log_rpc_call(self.market.as_str(), duration, result.is_ok());

        let (trades, cursor) = result?;
        if let Some(cursor) = cursor {
            self.cursor = cursor;
        }
        MetricsLogger::log_trades_polled(self.market.as_str(), trades.len());
        Ok(trades)
    }

    async fn fetch(&self) -> Result<(Vec<Trade>, Option<Cursor>), IndexerError> {
        let quote_price = self.quote_price()?;

        match (&self.market, &self.cursor) {
            (Market::Hotbit, Cursor::LastId(last_id)) => {
                let url = format!(
                    "{}/api/v1/market.deals?market=IDNA/BTC&limit=100&last_id={}",
                    self.base_url, last_id
                );
                let raw = self.get_json::<HotbitResponse>(&url).await?.result.unwrap_or_default();
                let next = raw.iter().map(|t| t.id).max().map(Cursor::LastId);
                Ok((convert_all(self.market, raw, |t| t.into_trade(quote_price)), next))
            }
            (Market::Bitmart, Cursor::After(last)) => {
                let url = format!("{}/spot/v1/symbols/trades?symbol=IDNA_USDT", self.base_url);
                let raw: Vec<_> = self
                    .get_json::<BitmartResponse>(&url)
                    .await?
                    .data
                    .trades
                    .into_iter()
                    .filter(|t| t.order_time > *last)
                    .collect();
                let next = raw.iter().map(|t| t.order_time).max().map(Cursor::After);
                Ok((convert_all(self.market, raw, |t| t.into_trade(quote_price)), next))
            }
            (Market::Vitex, Cursor::After(last)) => {
                let url = format!("{}/api/v2/trades?symbol=IDNA-000_BTC-000&limit=100", self.base_url);
                let raw: Vec<_> = self
                    .get_json::<VitexResponse>(&url)
                    .await?
                    .data
                    .into_iter()
                    .filter(|t| t.timestamp > *last)
                    .collect();
                let next = raw.iter().map(|t| t.timestamp).max().map(Cursor::After);
                Ok((convert_all(self.market, raw, |t| t.into_trade(quote_price)), next))
            }
            (Market::Probit, Cursor::Since(since)) => {
                let url = format!(
                    "{}/api/exchange/v1/trade?market_id=IDNA-BTC&start_time={}Z&end_time=9999-12-21T03:00:00.000Z&limit=1000",
                    self.base_url,
                    since.format("%Y-%m-%dT%H:%M:%S%.3f")
                );
                let raw = self.get_json::<ProbitResponse>(&url).await?.data;
                let trades = convert_all(self.market, raw, |t| t.into_trade(quote_price));
                let next = trades
                    .iter()
                    .map(|t| t.timestamp)
                    .max()
                    .map(|latest| Cursor::Since(latest + ChronoDuration::milliseconds(1)));
                Ok((trades, next))
            }
            (market, cursor) => Err(IndexerError::Processing(ProcessingError::UnexpectedShape(format!(
                "{} feed with cursor {:?}",
                market, cursor
            )))),
        }
    }

    /// Poll loop; ends on shutdown or when the receiver is gone
    pub async fn run(mut self, tx: mpsc::Sender<Vec<Trade>>, shutdown: ShutdownSignal) {
        let context = LogContext::new("exchange_feed", "run").with_metadata("market", serde_json::json!(self.market.as_str()));
        context.info(&format!("{} trade listener started", self.market.name()));

        loop {
            let jitter = Duration::from_millis(rand::random::<u64>() % 1000);
            if !shutdown.sleep(self.poll_interval() + jitter).await {
                break;
            }

            match self.poll().await {
                Ok(trades) if trades.is_empty() => {}
                Ok(trades) => {
                    if tx.send(trades).await.is_err() {
                        context.warn("Trade channel closed");
                        break;
                    }
                }
                Err(e) => {
                    context.error(&format!("{} poll failed: {}", self.market.name(), e));
                    if !shutdown.sleep(self.interval).await {
                        break;
                    }
                }
            }
        }

        context.debug("Cancelled");
    }
}
