use rust_decimal::Decimal;
use serde_json::json;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use chain_activity_tracker::models::PriceBook;
use chain_activity_tracker::{ExchangeFeed, Market, ShutdownSignal};

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn feed(market: Market, server: &MockServer) -> ExchangeFeed {
    ExchangeFeed::new(market, Duration::from_millis(20), PriceBook::default(), Duration::from_secs(5))
        .unwrap()
        .with_base_url(&server.uri())
}

async fn mount_bitmart(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/spot/v1/symbols/trades"))
        .and(query_param("symbol", "IDNA_USDT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"trades": [
                {"order_time": 1_658_497_520_000i64, "price": "0.0350", "count": "1000", "type": "buy"},
                {"order_time": 1_658_497_510_000i64, "price": "0.0348", "count": "200", "type": "sell"}
            ]}
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_bitmart_returns_only_new_trades() {
    let server = MockServer::start().await;
    mount_bitmart(&server).await;
    let mut feed = feed(Market::Bitmart, &server);

    let trades = feed.poll().await.unwrap();
    assert_eq!(trades.len(), 2);
    let buy = trades.iter().find(|t| t.buy).unwrap();
    assert_eq!(buy.id, "1658497520000");
    assert_eq!(buy.amount, dec("1000"));
    // Tether quote at one dollar
    assert_eq!(buy.usd_value, dec("35"));
    assert_eq!(buy.quote, "cg:tether");

    assert!(feed.poll().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_hotbit_advances_last_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/market.deals"))
        .and(query_param("last_id", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": [
                {"id": 5143035131i64, "time": 1_658_497_520, "price": "0.00000151", "amount": "742.76", "type": "buy"},
                {"id": 5143035130i64, "time": 1_658_497_500, "price": "0.00000150", "amount": "10", "type": "sell"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/market.deals"))
        .and(query_param("last_id", "5143035131"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": null})))
        .expect(1)
        .mount(&server)
        .await;

    let mut feed = feed(Market::Hotbit, &server);
    let trades = feed.poll().await.unwrap();
    assert_eq!(trades.len(), 2);
    assert!(trades.iter().all(|t| t.quote == "cg:bitcoin"));
    assert!(feed.poll().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_probit_trade_is_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/exchange/v1/trade"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"id": "IDNA-BTC:7", "price": "0.0000015", "quantity": "300", "time": "2022-07-22T13:45:20.000Z", "side": "sell"},
                {"id": "broken", "price": "0.0000015", "quantity": "1", "time": "2022-07-22T13:45:21.000Z", "side": "buy"}
            ]
        })))
        .mount(&server)
        .await;

    let trades = feed(Market::Probit, &server).poll().await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].id, "7");
    assert!(!trades[0].buy);
}

#[tokio::test]
async fn test_server_error_surfaces_from_poll() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(502)).mount(&server).await;

    assert!(feed(Market::Vitex, &server).poll().await.is_err());
}

#[tokio::test]
async fn test_run_forwards_trades_until_shutdown() {
    let server = MockServer::start().await;
    mount_bitmart(&server).await;

    let shutdown = ShutdownSignal::new();
    let (tx, mut rx) = mpsc::channel(4);
    let handle = tokio::spawn(feed(Market::Bitmart, &server).run(tx, shutdown.clone()));

    let trades = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(trades.len(), 2);

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    // Later polls found nothing new
    assert!(rx.try_recv().is_err());
}
