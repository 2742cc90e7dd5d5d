use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

use chain_activity_tracker::blockchain::evm::{group_by_transaction, widen, TxClassifier, TRANSFER_TOPIC};
use chain_activity_tracker::blockchain::{LogFilter, RpcClient, TopicFilter};
use chain_activity_tracker::models::{AddressType, KnownAddress, KnownAddresses, PriceBook, Tag};
use chain_activity_tracker::{IndexerError, RetryConfig, ShutdownSignal};

const TOKEN: &str = "0x0de08c1abe5fb86dd7fd2ac90400ace305138d5b";
const POOL: &str = "0x00000000000000000000000000000000000000aa";
const USER: &str = "0x00000000000000000000000000000000000000b1";

fn client(server: &MockServer) -> RpcClient {
    RpcClient::new(&server.uri(), Duration::from_secs(5))
        .unwrap()
        .with_retry(RetryConfig::fixed(3, Duration::from_millis(10)))
}

fn rpc_result(result: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": result}))
}

fn transfer_log(from: &str, to: &str, wei_hex: &str, index: u32) -> serde_json::Value {
    serde_json::json!({
        "address": TOKEN,
        "topics": [TRANSFER_TOPIC, widen(from), widen(to)],
        "data": format!("0x{:0>64}", wei_hex),
        "blockNumber": "0x64",
        "transactionHash": "0xabc",
        "logIndex": format!("0x{:x}", index),
        "removed": false
    })
}

#[tokio::test]
async fn test_block_number_retries_server_errors() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    Mock::given(method("POST"))
        .respond_with(move |_: &wiremock::Request| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                ResponseTemplate::new(500)
            } else {
                rpc_result(serde_json::json!("0x1344e0d"))
            }
        })
        .mount(&server)
        .await;

    let block = client(&server).get_block_number().await.unwrap();
    assert_eq!(block, 0x1344e0d);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_method_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32603, "message": "Internal error"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = client(&server).get_block_number().await;
    assert!(matches!(result, Err(IndexerError::Rpc(_))));
}

#[tokio::test]
async fn test_shutdown_abandons_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(503)).mount(&server).await;

    let shutdown = ShutdownSignal::new();
    let rpc = RpcClient::new(&server.uri(), Duration::from_secs(5))
        .unwrap()
        .with_retry(RetryConfig::fixed(10, Duration::from_secs(30)))
        .with_shutdown(shutdown.clone());

    let handle = tokio::spawn(async move { rpc.get_block_number().await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.trigger();

    let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(ref e) if e.is_shutdown()));
}

#[tokio::test]
async fn test_block_timestamp_and_signer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({"method": "eth_getBlockByNumber"})))
        .respond_with(rpc_result(serde_json::json!({"number": "0x64", "timestamp": "0x62d9a6f0"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({"method": "eth_getTransactionByHash"})))
        .respond_with(rpc_result(serde_json::json!({"hash": "0xabc", "from": "0x00000000000000000000000000000000000000B1"})))
        .mount(&server)
        .await;

    let rpc = client(&server);
    assert_eq!(rpc.get_block_timestamp(100).await.unwrap(), Some(0x62d9a6f0));
    assert_eq!(rpc.get_transaction_signer("0xabc").await.unwrap().as_deref(), Some(USER));
}

#[tokio::test]
async fn test_fetched_logs_classify_as_dex_buy() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({"method": "eth_getLogs"})))
        .respond_with(rpc_result(serde_json::json!([
            // 1000 tokens out of the pool to the buyer
            transfer_log(POOL, USER, "3635c9adc5dea00000", 3),
        ])))
        .mount(&server)
        .await;

    let filter = LogFilter::new(vec![TopicFilter::One(TRANSFER_TOPIC.to_string())]).at(TOKEN).range(100, 100);
    let logs = client(&server).get_logs(&filter).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].block_number, 100);
    assert_eq!(logs[0].log_index, 3);

    let registry = KnownAddresses::from_entries([(POOL.to_string(), KnownAddress::new(AddressType::Pool))]);
    let prices = PriceBook::default();
    let classifier = TxClassifier::new(&registry, &prices, TOKEN);

    let groups = group_by_transaction(logs);
    assert_eq!(groups.len(), 1);
    let tf = classifier.classify(&groups[0], None, USER).unwrap().unwrap();
    assert!(tf.has_tag(Tag::Dex));
    assert!(tf.has_tag(Tag::DexBuy));
    assert_eq!(tf.value(true), rust_decimal::Decimal::from(1000));
}
