use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::Market;
use crate::error::ProcessingError;
use crate::logging::LogContext;
use crate::models::Trade;

fn millis_to_time(millis: i64) -> Result<DateTime<Utc>, ProcessingError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| ProcessingError::TransactionParsing(format!("invalid trade time {}", millis)))
}

fn build_trade(
    market: Market,
    id: String,
    timestamp: DateTime<Utc>,
    amount: Decimal,
    price: Decimal,
    buy: bool,
    quote_price: Decimal,
) -> Trade {
    Trade {
        id,
        market,
        timestamp,
        amount,
        price,
        usd_value: amount * price * quote_price,
        quote: market.quote().to_string(),
        buy,
    }
}

#[derive(Debug, Deserialize)]
pub struct HotbitTrade {
    pub id: i64,
    pub time: i64,
    pub price: Decimal,
    pub amount: Decimal,
    #[serde(rename = "type")]
    pub side: String,
}

#[derive(Debug, Deserialize)]
pub struct HotbitResponse {
    #[serde(default)]
    pub result: Option<Vec<HotbitTrade>>,
}

impl HotbitTrade {
    pub fn into_trade(self, quote_price: Decimal) -> Result<Trade, ProcessingError> {
        let timestamp = Utc
            .timestamp_opt(self.time, 0)
            .single()
            .ok_or_else(|| ProcessingError::TransactionParsing(format!("invalid trade time {}", self.time)))?;
        Ok(build_trade(
            Market::Hotbit,
            self.id.to_string(),
            timestamp,
            self.amount,
            self.price,
            self.side == "buy",
            quote_price,
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct BitmartTrade {
    /// Milliseconds, doubles as the trade id
    pub order_time: i64,
    pub price: Decimal,
    pub count: Decimal,
    #[serde(rename = "type")]
    pub side: String,
}

#[derive(Debug, Deserialize)]
pub struct BitmartTrades {
    pub trades: Vec<BitmartTrade>,
}

#[derive(Debug, Deserialize)]
pub struct BitmartResponse {
    pub data: BitmartTrades,
}

impl BitmartTrade {
    pub fn into_trade(self, quote_price: Decimal) -> Result<Trade, ProcessingError> {
        Ok(build_trade(
            Market::Bitmart,
            self.order_time.to_string(),
            millis_to_time(self.order_time)?,
            self.count,
            self.price,
            self.side == "buy",
            quote_price,
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct VitexTrade {
    /// Milliseconds, doubles as the trade id
    pub timestamp: i64,
    pub price: Decimal,
    pub amount: Decimal,
    /// 0 is a buy
    pub side: u8,
}

#[derive(Debug, Deserialize)]
pub struct VitexResponse {
    #[serde(default)]
    pub data: Vec<VitexTrade>,
}

impl VitexTrade {
    pub fn into_trade(self, quote_price: Decimal) -> Result<Trade, ProcessingError> {
        Ok(build_trade(
            Market::Vitex,
            self.timestamp.to_string(),
            millis_to_time(self.timestamp)?,
            self.amount,
            self.price,
            self.side == 0,
            quote_price,
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct ProbitTrade {
    /// `MARKET:sequence`
    pub id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub time: String,
    pub side: String,
}

#[derive(Debug, Deserialize)]
pub struct ProbitResponse {
    #[serde(default)]
    pub data: Vec<ProbitTrade>,
}

impl ProbitTrade {
    pub fn into_trade(self, quote_price: Decimal) -> Result<Trade, ProcessingError> {
        let sequence = self
            .id
            .split(':')
            .nth(1)
            .ok_or_else(|| ProcessingError::TransactionParsing(format!("invalid probit trade id {}", self.id)))?;
        let timestamp = DateTime::parse_from_rfc3339(&self.time)
            .map_err(|e| ProcessingError::TransactionParsing(format!("invalid probit time {}: {}", self.time, e)))?
            .with_timezone(&Utc);
        Ok(build_trade(
            Market::Probit,
            sequence.to_string(),
            timestamp,
            self.quantity,
            self.price,
            self.side == "buy",
            quote_price,
        ))
    }
}

/// Converts raw trades, logging and skipping the ones that fail
pub fn convert_all<T, F>(market: Market, raw: Vec<T>, convert: F) -> Vec<Trade>
where
    F: Fn(T) -> Result<Trade, ProcessingError>,
{
    raw.into_iter()
        .filter_map(|item| match convert(item) {
            Ok(trade) => Some(trade),
            Err(e) => {
                LogContext::new("exchange_feed", "convert")
                    .with_metadata("market", serde_json::json!(market.to_string()))
                    .with_metadata("error", serde_json::json!(e.to_string()))
                    .warn("Skipping malformed trade");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_parse_hotbit() {
        let body = r#"{"error":null,"result":[
            {"id":5143035131,"time":1658497520,"price":"0.00000151","amount":"742.76","type":"buy"},
            {"id":5143033788,"time":1658497483,"price":"0.00000154","amount":"726.88","type":"sell"}]}"#;
        let response: HotbitResponse = serde_json::from_str(body).unwrap();
        let trades = convert_all(Market::Hotbit, response.result.unwrap(), |t| t.into_trade(dec("20000")));

        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].id, "5143035131");
        assert!(trades[0].buy);
        assert!(!trades[1].buy);
        assert_eq!(trades[0].timestamp.timestamp(), 1_658_497_520);
        assert_eq!(trades[0].usd_value, dec("742.76") * dec("0.00000151") * dec("20000"));
        assert_eq!(trades[0].quote, "cg:bitcoin");
    }

    #[test]
    fn test_parse_bitmart() {
        let body = r#"{"message":"OK","code":1000,"data":{"trades":[
            {"amount":"32.505743","order_time":1658497856533,"price":"0.035307","count":"920.66","type":"buy"}]}}"#;
        let response: BitmartResponse = serde_json::from_str(body).unwrap();
        let trades = convert_all(Market::Bitmart, response.data.trades, |t| t.into_trade(Decimal::ONE));

        assert_eq!(trades[0].id, "1658497856533");
        assert_eq!(trades[0].amount, dec("920.66"));
        assert_eq!(trades[0].timestamp.timestamp(), 1_658_497_856);
        assert_eq!(trades[0].market, Market::Bitmart);
    }

    #[test]
    fn test_parse_vitex_side() {
        let body = r#"{"code":0,"msg":"ok","data":[
            {"timestamp":1672361525000,"price":"0.00000051","amount":"535.82320000","side":1},
            {"timestamp":1671230363000,"price":"0.00000125","amount":"1066.68880000","side":0}]}"#;
        let response: VitexResponse = serde_json::from_str(body).unwrap();
        let trades = convert_all(Market::Vitex, response.data, |t| t.into_trade(Decimal::ONE));

        assert!(!trades[0].buy);
        assert!(trades[1].buy);
        assert_eq!(trades[1].id, "1671230363000");
    }

    #[test]
    fn test_parse_probit_and_skip_malformed() {
        let body = r#"{"data": [
            {"id": "IDNA-BTC:319985", "price": "0.0000007077", "quantity": "961.2376",
             "time": "2023-01-03T14:16:43.908Z", "side": "buy", "tick_direction": "down"},
            {"id": "broken", "price": "1", "quantity": "1", "time": "2023-01-03T14:16:43.908Z", "side": "sell"}]}"#;
        let response: ProbitResponse = serde_json::from_str(body).unwrap();
        let trades = convert_all(Market::Probit, response.data, |t| t.into_trade(Decimal::ONE));

        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].id, "319985");
        assert_eq!(trades[0].timestamp.timestamp_millis(), 1_672_755_403_908);
    }
}
