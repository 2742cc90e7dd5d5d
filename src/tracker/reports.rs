use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::cex::market_stats;
use crate::blockchain::evm::NULL_ADDRESS;
use crate::config::TrackerConfig;
use crate::database::BackingStore;
use crate::error::IndexerError;
use crate::events::market::sort_markets;
use crate::events::{
    next_event_id, Event, MarketStats, PoolStatsEvent, StakeEntry, StatsEvent, TopDexEvent, TopEvent, TopKillEvent,
    TopStakeEvent,
};
use crate::exchanges::Market;
use crate::logging::{ErrorLogger, LogContext, MetricsLogger};
use crate::models::{aggregate_dex_trades, KnownAddresses, PriceBook, Tag, Transfer, KILL_TAGS};
use crate::shutdown::ShutdownSignal;

const STATS_START_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

/// Ranked views over the recent window
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TopKind {
    Transfers,
    Dex,
    Kills,
    Stakes,
}

fn since(now: DateTime<Utc>, period: u64) -> DateTime<Utc> {
    now - Duration::seconds(period as i64)
}

fn sum_null_changes<'a>(tfs: impl Iterator<Item = &'a Transfer>) -> Decimal {
    tfs.filter_map(|tf| tf.changes.get(NULL_ADDRESS)).sum::<Decimal>().abs()
}

/// Chain and market activity over the last `period` seconds
pub fn generate_stats(
    store: &dyn BackingStore,
    registry: &KnownAddresses,
    prices: &PriceBook,
    period: u64,
    now: DateTime<Utc>,
) -> Result<StatsEvent, IndexerError> {
    let after = since(now, period);
    let tfs = store.get_recent_transfers(after)?;
    let trades = store.get_recent_trades(after, std::time::Duration::from_secs(period))?;

    let tagged = |tag: Tag| tfs.iter().filter(move |tf| tf.has_tag(tag));
    let count = |tag: Tag| tagged(tag).count();

    let mut markets: Vec<MarketStats> = market_stats(&trades).into_values().collect();
    let dex_tfs: Vec<&Transfer> = tfs.iter().filter(|tf| tf.has_tag(Tag::Dex) && !tf.has_tag(Tag::DexArb)).collect();
    let dex = aggregate_dex_trades(dex_tfs.iter().copied(), registry);
    if !dex.volume().is_zero() {
        let mut bsc = MarketStats::new(Market::Bsc);
        bsc.buy = dex.buy;
        bsc.sell = dex.sell;
        bsc.buy_usd = dex.buy_usd;
        bsc.sell_usd = dex.sell_usd;
        bsc.quote_amount = dex.quote_amount;
        markets.push(bsc);
    }
    for stats in markets.iter_mut() {
        stats.calculate_average_price(prices);
    }
    sort_markets(&mut markets);

    Ok(StatsEvent {
        id: next_event_id(),
        period,
        transfer_count: tfs.len(),
        trade_count: trades.len(),
        invites_issued: count(Tag::Invite),
        invites_activated: count(Tag::Activation),
        flips_submitted: count(Tag::SubmitFlip),
        identities_killed: tfs.iter().filter(|tf| tf.has_any_tag(&KILL_TAGS)).count(),
        contract_calls: count(Tag::CallContract),
        bridged_to_bsc: sum_null_changes(tagged(Tag::BridgeMint)),
        bridged_from_bsc: sum_null_changes(tagged(Tag::BridgeBurn)),
        staked: tagged(Tag::ReplenishStake).map(|tf| tf.value(false)).sum(),
        unstaked: tfs.iter().filter(|tf| tf.has_any_tag(&KILL_TAGS)).map(|tf| tf.value(true)).sum(),
        burned: tagged(Tag::Burn).map(|tf| tf.value(false)).sum(),
        lp_usd: dex.lp_usd,
        markets,
    })
}

fn by_usd_desc(a: &Transfer, b: &Transfer) -> std::cmp::Ordering {
    b.usd_value().cmp(&a.usd_value())
}

fn truncate<T>(items: &mut Vec<T>, lines: usize) -> usize {
    let full = items.len();
    items.truncate(lines);
    full - items.len()
}

/// A ranked view of the last `period` seconds, `None` when nothing qualifies
pub fn generate_top(
    store: &dyn BackingStore,
    registry: &KnownAddresses,
    config: &TrackerConfig,
    kind: TopKind,
    period: u64,
    long: bool,
    now: DateTime<Utc>,
) -> Result<Option<Event>, IndexerError> {
    let lines = if long { config.top_events_long_lines } else { config.top_events_max_lines };
    let all = store.get_recent_transfers(since(now, period))?;

    let event = match kind {
        TopKind::Transfers => {
            let mut tfs: Vec<Transfer> = all
                .into_iter()
                .filter(|tf| {
                    !tf.has_any_tag(&KILL_TAGS)
                        && !tf.has_tag(Tag::ReplenishStake)
                        && !tf.has_tag(Tag::Dex)
                        && !tf.usd_value().is_zero()
                })
                .collect();
            if tfs.is_empty() {
                return Ok(None);
            }
            let total_usd_value = tfs.iter().map(|tf| tf.usd_value()).sum();
            tfs.sort_by(by_usd_desc);
            let truncated = truncate(&mut tfs, lines);
            Event::Top(TopEvent {
                id: next_event_id(),
                period,
                tfs,
                total_usd_value,
                long,
                truncated,
            })
        }
        TopKind::Dex => {
            let mut tfs: Vec<Transfer> = all.into_iter().filter(|tf| tf.has_tag(Tag::Dex)).collect();
            if tfs.is_empty() {
                return Ok(None);
            }
            let aggr = aggregate_dex_trades(tfs.iter(), registry);
            tfs.sort_by(by_usd_desc);
            let truncated = truncate(&mut tfs, lines);
            Event::TopDex(TopDexEvent {
                id: next_event_id(),
                period,
                tfs,
                total_usd_value: aggr.quote_amount,
                buy_usd: aggr.buy_usd,
                sell_usd: aggr.sell_usd,
                lp_usd: aggr.lp_usd,
                total_idna: aggr.volume(),
                long,
                truncated,
            })
        }
        TopKind::Kills => {
            let mut tfs: Vec<Transfer> = all.into_iter().filter(|tf| tf.has_any_tag(&KILL_TAGS)).collect();
            if tfs.is_empty() {
                return Ok(None);
            }
            let total_usd_value = tfs.iter().map(|tf| tf.usd_value()).sum();
            let total_idna = tfs.iter().map(|tf| tf.value(true)).sum();
            let total_age = tfs.iter().map(|tf| tf.meta.age.unwrap_or(0)).sum();
            tfs.sort_by(|a, b| b.meta.age.cmp(&a.meta.age).then_with(|| by_usd_desc(a, b)));
            let truncated = truncate(&mut tfs, lines);
            Event::TopKill(TopKillEvent {
                id: next_event_id(),
                period,
                tfs,
                total_usd_value,
                total_idna,
                total_age,
                long,
                truncated,
            })
        }
        TopKind::Stakes => {
            let mut stakers: HashMap<String, StakeEntry> = HashMap::new();
            for tf in all.iter().filter(|tf| tf.has_tag(Tag::ReplenishStake)) {
                let signer = tf.signer.clone().unwrap_or_default();
                let entry = stakers.entry(signer.clone()).or_insert_with(|| StakeEntry {
                    signer,
                    stake: Decimal::ZERO,
                    stake_usd: Decimal::ZERO,
                });
                entry.stake += tf.value(false);
                entry.stake_usd += tf.usd_value();
            }
            if stakers.is_empty() {
                return Ok(None);
            }
            let mut identities: Vec<StakeEntry> = stakers.into_values().collect();
            let total_usd_value = identities.iter().map(|e| e.stake_usd).sum();
            let total_idna = identities.iter().map(|e| e.stake).sum();
            identities.sort_by(|a, b| b.stake.cmp(&a.stake).then_with(|| a.signer.cmp(&b.signer)));
            let truncated = truncate(&mut identities, lines);
            Event::TopStake(TopStakeEvent {
                id: next_event_id(),
                period,
                identities,
                total_usd_value,
                total_idna,
                long,
                truncated,
            })
        }
    };
    Ok(Some(event))
}

fn ranked(counts: BTreeMap<String, u64>, lines: usize) -> Vec<(String, u64)> {
    let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(lines);
    ranked
}

/// Kills and delegation changes per pool over the last `period` seconds
pub fn generate_pool_stats(
    store: &dyn BackingStore,
    config: &TrackerConfig,
    period: u64,
    long: bool,
    now: DateTime<Utc>,
) -> Result<Option<PoolStatsEvent>, IndexerError> {
    let lines = if long { config.top_events_long_lines } else { config.top_events_max_lines };
    let mut killed = BTreeMap::new();
    let mut delegated = BTreeMap::new();
    let mut undelegated = BTreeMap::new();

    for tf in store.get_recent_transfers(since(now, period))? {
        let Some(pool) = tf.meta.pool.clone() else {
            continue;
        };
        let counts = if tf.has_any_tag(&KILL_TAGS) {
            &mut killed
        } else if tf.has_tag(Tag::Delegate) {
            &mut delegated
        } else if tf.has_tag(Tag::Undelegate) {
            &mut undelegated
        } else {
            continue;
        };
        *counts.entry(pool).or_insert(0u64) += 1;
    }

    let event = PoolStatsEvent {
        id: next_event_id(),
        period,
        killed: ranked(killed, lines),
        delegated: ranked(delegated, lines),
        undelegated: ranked(undelegated, lines),
        long,
    };
    Ok((!event.is_empty()).then_some(event))
}

/// Emits a stats event every `stats_interval_seconds`
pub struct StatsWorker {
    store: Arc<dyn BackingStore>,
    registry: Arc<KnownAddresses>,
    prices: PriceBook,
    interval: u64,
    shutdown: ShutdownSignal,
}

impl StatsWorker {
    pub fn new(
        store: Arc<dyn BackingStore>,
        registry: Arc<KnownAddresses>,
        prices: PriceBook,
        interval: u64,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            store,
            registry,
            prices,
            interval,
            shutdown,
        }
    }

    pub async fn run(self, tx: mpsc::Sender<Event>) {
        let context = LogContext::new("tracker", "stats");
        if !self.shutdown.sleep(STATS_START_DELAY).await {
            return;
        }
        loop {
            if !self.shutdown.sleep(std::time::Duration::from_secs(self.interval)).await {
                break;
            }
            match generate_stats(self.store.as_ref(), &self.registry, &self.prices, self.interval, Utc::now()) {
                Ok(stats) => {
                    let event = Event::Stats(stats);
                    MetricsLogger::log_event_emitted(event.kind(), event.id());
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => ErrorLogger::log_error(&e, Some(context.clone())),
            }
        }
        context.debug("Stats worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::models::{AddressType, Chain, KnownAddress, Trade};
    use std::sync::atomic::{AtomicU32, Ordering};

    const POOL: &str = "0x05ad60d9a2f1aa30ba0cdbaf1e0a0a145fbea16f";

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn registry() -> KnownAddresses {
        KnownAddresses::from_entries([(POOL.to_string(), KnownAddress::new(AddressType::Pool))])
    }

    static LOG_INDEX: AtomicU32 = AtomicU32::new(0);

    fn tf(hash: &str, chain: Chain, from: &str, to: Option<&str>, amount: &str, tag: Tag) -> Transfer {
        let mut tf = Transfer::new(hash, chain, 1, LOG_INDEX.fetch_add(1, Ordering::Relaxed));
        tf.timestamp = Some(Utc::now() - Duration::seconds(10));
        tf.signer = Some(from.to_string());
        tf.changes = Transfer::create_changes(from, to, dec(amount));
        tf.tags.insert(tag);
        tf
    }

    fn seeded() -> Database {
        let db = Database::new_in_memory().unwrap();

        let mut mint = tf("0xm", Chain::Bsc, NULL_ADDRESS, Some("0xa"), "300", Tag::BridgeMint);
        mint.meta.usd_value = Some(dec("10"));
        let burn = tf("0xb", Chain::Bsc, "0xa", Some(NULL_ADDRESS), "100", Tag::BridgeBurn);

        let mut buy = tf("0xd", Chain::Bsc, POOL, Some("0xa"), "1000", Tag::DexBuy);
        buy.tags.insert(Tag::Dex);
        buy.meta.usd_value = Some(dec("35"));

        let mut kill = tf("0xk", Chain::Idena, "0xk1", None, "500", Tag::Kill);
        kill.changes.negate();
        kill.meta.age = Some(7);
        kill.meta.pool = Some("0xpool".to_string());
        kill.meta.usd_value = Some(dec("17.5"));

        let mut old = tf("0xk2", Chain::Idena, "0xk2", None, "50", Tag::Kill);
        old.changes.negate();
        old.meta.age = Some(30);

        let mut stake1 = tf("0xs1", Chain::Idena, "0xs", None, "40", Tag::ReplenishStake);
        stake1.meta.usd_value = Some(dec("1.4"));
        let mut stake2 = tf("0xs2", Chain::Idena, "0xs", None, "60", Tag::ReplenishStake);
        stake2.meta.usd_value = Some(dec("2.1"));
        let mut stake3 = tf("0xs3", Chain::Idena, "0xt", None, "10", Tag::ReplenishStake);
        stake3.meta.usd_value = Some(dec("0.35"));

        let mut send = tf("0xt", Chain::Idena, "0xa", Some("0xb"), "2000", Tag::Send);
        send.meta.usd_value = Some(dec("70"));

        let mut delegate = tf("0xdl", Chain::Idena, "0xc", None, "0", Tag::Delegate);
        delegate.meta.pool = Some("0xpool".to_string());

        let invite = tf("0xi", Chain::Idena, "0xa", Some("0xn"), "0", Tag::Invite);

        db.insert_transfers(&[mint, burn, buy, kill, old, stake1, stake2, stake3, send, delegate, invite]).unwrap();
        db.insert_trades(&[Trade {
            id: "1".to_string(),
            market: Market::Bitmart,
            timestamp: Utc::now() - Duration::seconds(10),
            amount: dec("100"),
            price: dec("0.035"),
            usd_value: dec("3.5"),
            quote: "cg:tether".to_string(),
            buy: true,
        }])
        .unwrap();
        db
    }

    #[test]
    fn test_stats_counts_and_volumes() {
        let db = seeded();
        let stats = generate_stats(&db, &registry(), &PriceBook::default(), 3600, Utc::now()).unwrap();

        assert_eq!(stats.transfer_count, 11);
        assert_eq!(stats.trade_count, 1);
        assert_eq!(stats.invites_issued, 1);
        assert_eq!(stats.identities_killed, 2);
        assert_eq!(stats.bridged_to_bsc, dec("300"));
        assert_eq!(stats.bridged_from_bsc, dec("100"));
        assert_eq!(stats.staked, dec("110"));
        assert_eq!(stats.unstaked, dec("550"));
        assert_eq!(stats.markets.len(), 2);
        // BSC moved more of the coin
        assert_eq!(stats.markets[0].market, Market::Bsc);
        assert_eq!(stats.markets[0].buy, dec("1000"));
        assert_eq!(stats.markets[1].avg_price, "$0.035");
    }

    #[test]
    fn test_top_views() {
        let db = seeded();
        let config = TrackerConfig {
            top_events_max_lines: 1,
            ..TrackerConfig::default()
        };
        let now = Utc::now();

        match generate_top(&db, &registry(), &config, TopKind::Transfers, 3600, false, now).unwrap() {
            Some(Event::Top(top)) => {
                // The mint is the only other valued plain transfer
                assert_eq!(top.tfs[0].hash, "0xt");
                assert_eq!(top.truncated, 1);
                assert_eq!(top.total_usd_value, dec("80"));
            }
            other => panic!("unexpected {:?}", other),
        }

        match generate_top(&db, &registry(), &config, TopKind::Kills, 3600, true, now).unwrap() {
            Some(Event::TopKill(top)) => {
                assert_eq!(top.tfs.len(), 2);
                assert_eq!(top.tfs[0].hash, "0xk2");
                assert_eq!(top.total_age, 37);
                assert_eq!(top.truncated, 0);
            }
            other => panic!("unexpected {:?}", other),
        }

        match generate_top(&db, &registry(), &config, TopKind::Stakes, 3600, false, now).unwrap() {
            Some(Event::TopStake(top)) => {
                assert_eq!(top.identities[0].signer, "0xs");
                assert_eq!(top.identities[0].stake, dec("100"));
                assert_eq!(top.total_idna, dec("110"));
                assert_eq!(top.truncated, 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        let empty = Database::new_in_memory().unwrap();
        assert!(generate_top(&empty, &registry(), &config, TopKind::Dex, 3600, false, now).unwrap().is_none());
    }

    #[test]
    fn test_pool_stats() {
        let db = seeded();
        let stats = generate_pool_stats(&db, &TrackerConfig::default(), 3600, false, Utc::now()).unwrap().unwrap();
        assert_eq!(stats.killed, vec![("0xpool".to_string(), 1)]);
        assert_eq!(stats.delegated, vec![("0xpool".to_string(), 1)]);
        assert!(stats.undelegated.is_empty());

        let empty = Database::new_in_memory().unwrap();
        assert!(generate_pool_stats(&empty, &TrackerConfig::default(), 3600, false, Utc::now()).unwrap().is_none());
    }
}
