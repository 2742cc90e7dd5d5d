use rust_decimal::Decimal;

use super::NotifiedHashes;
use crate::config::TrackerConfig;
use crate::events::DexEvent;
use crate::logging::LogContext;
use crate::models::{aggregate_dex_trades, KnownAddresses, Tag, Transfer, DEX_LP_TAGS, DEX_TRADE_TAGS};

/// DEX activity over the recent window.
///
/// A single transfer above the volume threshold is reported on its own. The
/// rest are summed separately for trades and liquidity changes, and each group
/// above the threshold becomes one aggregated event.
pub fn check_dex_events(
    tfs: &[Transfer],
    config: &TrackerConfig,
    registry: &KnownAddresses,
    notified: &mut NotifiedHashes,
) -> Vec<DexEvent> {
    let threshold = config.recent_dex_volume_threshold;
    let mut singles = Vec::new();
    let mut trades: Vec<&Transfer> = Vec::new();
    let mut lps: Vec<&Transfer> = Vec::new();
    let mut trade_volume = Decimal::ZERO;
    let mut lp_volume = Decimal::ZERO;

    for tf in tfs {
        if !tf.has_tag(Tag::Dex) || notified.contains(&tf.hash) {
            continue;
        }
        let usd_value = tf.usd_value();
        if usd_value > threshold {
            notified.insert(&tf.hash, tf.time_or_epoch());
            singles.push(tf);
        } else if tf.has_any_tag(&DEX_LP_TAGS) {
            lp_volume += usd_value;
            lps.push(tf);
        } else if tf.has_any_tag(&DEX_TRADE_TAGS) {
            trade_volume += usd_value;
            trades.push(tf);
        }
    }

    let mut events: Vec<DexEvent> = singles
        .into_iter()
        .map(|tf| DexEvent::from_tfs(vec![tf.clone()], registry))
        .collect();

    for (volume, group) in [(trade_volume, trades), (lp_volume, lps)] {
        if volume <= threshold {
            continue;
        }
        for tf in &group {
            notified.insert(&tf.hash, tf.time_or_epoch());
        }
        events.push(aggregated_event(group, config.majority_volume_fraction, registry));
    }

    for event in &events {
        LogContext::new("tracker", "dex")
            .with_amount(event.amount)
            .with_metadata("transfers", serde_json::json!(event.tfs.len()))
            .with_metadata("truncated", serde_json::json!(event.truncated))
            .info("DEX volume");
    }
    events
}

/// Keeps the largest transfers until they carry `fraction` of the group's volume
fn aggregated_event(mut group: Vec<&Transfer>, fraction: Decimal, registry: &KnownAddresses) -> DexEvent {
    let time = group.iter().map(|tf| tf.time_or_epoch()).max();
    group.sort_by(|a, b| b.usd_value().cmp(&a.usd_value()));

    let aggr = aggregate_dex_trades(group.iter().copied(), registry);
    let total = aggr.buy_usd + aggr.sell_usd + aggr.lp_usd.abs();

    let mut keep = group.len();
    if !total.is_zero() {
        let mut top = Decimal::ZERO;
        for (i, tf) in group.iter().enumerate() {
            top += tf.usd_value();
            if top / total >= fraction {
                keep = i + 1;
                break;
            }
        }
    }

    let truncated = group.len() - keep;
    let mut event = DexEvent::from_tfs(group.into_iter().take(keep).cloned().collect(), registry);
    event.truncated = truncated;
    if let Some(time) = time {
        event.time = time;
    }
    event
}
