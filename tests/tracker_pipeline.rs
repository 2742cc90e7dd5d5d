use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use chain_activity_tracker::blockchain::ChainMessage;
use chain_activity_tracker::config::{PublisherConfig, TrackerConfig};
use chain_activity_tracker::database::{load_event, BackingStore, Database};
use chain_activity_tracker::events::{Event, EventSink, LOG_CHANNEL};
use chain_activity_tracker::exchanges::Market;
use chain_activity_tracker::models::{Chain, KnownAddresses, PriceBook, Tag, Trade, Transfer};
use chain_activity_tracker::{ShutdownSignal, Tracker};

const RECEIVER: &str = "0xfriend";

fn send(hash: &str, from: &str, log_index: u32) -> Transfer {
    let mut tf = Transfer::new(hash, Chain::Idena, 500, log_index);
    tf.timestamp = Some(Utc::now() - ChronoDuration::seconds(30));
    tf.signer = Some(from.to_string());
    tf.changes = Transfer::create_changes(from, Some(RECEIVER), Decimal::from(100_000));
    tf.tags.insert(Tag::Send);
    tf
}

struct Pipeline {
    store: Arc<Database>,
    shutdown: ShutdownSignal,
    chain_tx: mpsc::Sender<ChainMessage>,
    trade_tx: mpsc::Sender<Vec<Trade>>,
    events: mpsc::Receiver<Event>,
    tracker: tokio::task::JoinHandle<chain_activity_tracker::Result<()>>,
}

fn start(config: TrackerConfig) -> Pipeline {
    let store = Arc::new(Database::new_in_memory().unwrap());
    let shutdown = ShutdownSignal::new();
    let tracker = Tracker::new(
        config,
        store.clone(),
        Arc::new(KnownAddresses::default()),
        PriceBook::default(),
        shutdown.clone(),
    );

    let (chain_tx, chain_rx) = mpsc::channel(8);
    let (trade_tx, trade_rx) = mpsc::channel(8);
    let (event_tx, events) = mpsc::channel(8);
    let tracker = tokio::spawn(tracker.run(chain_rx, trade_rx, event_tx));

    Pipeline {
        store,
        shutdown,
        chain_tx,
        trade_tx,
        events,
        tracker,
    }
}

/// Next event of the given kind; periodic stats may arrive in between
async fn next_of_kind(events: &mut mpsc::Receiver<Event>, kind: &str) -> Event {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(15), events.recv())
            .await
            .expect("no event in time")
            .expect("tracker stopped");
        if event.kind() == kind {
            return event;
        }
    }
}

async fn stop(pipeline: Pipeline) {
    pipeline.shutdown.trigger();
    let result = tokio::time::timeout(Duration::from_secs(5), pipeline.tracker).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_large_sends_to_one_receiver_are_merged_in_the_log() {
    let mut pipeline = start(TrackerConfig::default());
    let mut sink = EventSink::new(
        &PublisherConfig::default(),
        pipeline.store.clone(),
        Arc::new(KnownAddresses::default()),
        PriceBook::default(),
    );

    pipeline
        .chain_tx
        .send(ChainMessage::Transfers { chain: Chain::Idena, tfs: vec![send("0xbig1", "0xwhale1", 0)] })
        .await
        .unwrap();
    let first = next_of_kind(&mut pipeline.events, "transfer").await;
    let first_id = first.id();
    sink.publish(first, Utc::now()).unwrap();

    pipeline
        .chain_tx
        .send(ChainMessage::Transfers { chain: Chain::Idena, tfs: vec![send("0xbig2", "0xwhale2", 1)] })
        .await
        .unwrap();
    let second = next_of_kind(&mut pipeline.events, "transfer").await;
    assert_ne!(second.id(), first_id);
    let merged = sink.publish(second, Utc::now()).unwrap();
    assert_eq!(merged.id(), first_id);

    let (stored, event) = load_event(pipeline.store.as_ref(), first_id).unwrap().expect("event not stored");
    assert_eq!(stored.channel, LOG_CHANNEL);
    assert_eq!(stored.message, "merged");
    match event {
        Event::Transfer(e) => {
            assert!(e.recv);
            assert_eq!(e.by, RECEIVER);
            assert_eq!(e.tfs.len(), 2);
            assert_eq!(e.amount, Decimal::from(200_000));
        }
        other => panic!("expected transfer event, got {:?}", other),
    }
    assert_eq!(pipeline.store.count_transfers().unwrap(), 2);

    stop(pipeline).await;
}

#[tokio::test]
async fn test_cex_volume_reaches_the_event_stream() {
    let config = TrackerConfig {
        cex_volume_threshold: Decimal::from(500),
        ..TrackerConfig::default()
    };
    let mut pipeline = start(config);

    let trade = |id: &str, amount: i64, buy: bool| Trade {
        id: id.to_string(),
        market: Market::Bitmart,
        timestamp: Utc::now(),
        amount: Decimal::from(amount),
        price: Decimal::new(35, 3),
        usd_value: Decimal::from(amount) * Decimal::new(35, 3),
        quote: "cg:tether".to_string(),
        buy,
    };
    pipeline
        .trade_tx
        .send(vec![trade("1", 20_000, true), trade("2", 4_000, false)])
        .await
        .unwrap();

    match next_of_kind(&mut pipeline.events, "cex").await {
        Event::Cex(e) => {
            assert_eq!(e.total_buy_val, Decimal::from(700));
            assert_eq!(e.total_sell_val, Decimal::from(140));
            assert!(e.market(Market::Bitmart).is_some());
        }
        other => panic!("expected cex event, got {:?}", other),
    }

    stop(pipeline).await;
}

#[tokio::test]
async fn test_closed_watchers_end_the_tracker() {
    let pipeline = start(TrackerConfig::default());
    let Pipeline { chain_tx, tracker, shutdown, .. } = pipeline;

    drop(chain_tx);
    let result = tokio::time::timeout(Duration::from_secs(5), tracker).await.unwrap().unwrap();
    assert!(result.is_ok());
    shutdown.trigger();
}
