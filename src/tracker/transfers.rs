use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};

use super::{memory_window, NotifiedHashes};
use crate::config::TrackerConfig;
use crate::events::TransferEvent;
use crate::logging::LogContext;
use crate::models::{PriceBook, Tag, Transfer};

#[derive(Debug, Clone, Default)]
struct Flows {
    sents: HashMap<String, Decimal>,
    recvs: HashMap<String, Decimal>,
}

#[derive(Debug, Default)]
struct AddressWindow<'a> {
    flows: Flows,
    tfs: Vec<&'a Transfer>,
}

#[derive(Debug, Clone, Copy)]
struct SentNotice {
    time: DateTime<Utc>,
    /// Seen while the address was moving value without a net outflow; such
    /// transfers are shown again once the outflow becomes large
    kept: bool,
}

/// Finds addresses whose net outflow over the recent window crossed the
/// transfer threshold since they were last reported.
///
/// The flows an address had when it was reported become its baseline, so a
/// later event only reports the outflow added since then.
#[derive(Debug, Default)]
pub struct LargeTransferDetector {
    baselines: HashMap<String, Flows>,
    sents_notified: HashMap<String, SentNotice>,
}

impl LargeTransferDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.baselines.clear();
        self.sents_notified.clear();
    }

    pub fn check(
        &mut self,
        tfs: &[Transfer],
        now: DateTime<Utc>,
        config: &TrackerConfig,
        prices: &PriceBook,
        notified: &NotifiedHashes,
    ) -> Vec<TransferEvent> {
        let price = prices.native();
        let threshold = config.recent_transfers_threshold;
        let mut windows: BTreeMap<&str, AddressWindow<'_>> = BTreeMap::new();

        for tf in tfs {
            if tf.has_no_effect() || tf.has_tag(Tag::Dex) || notified.contains(&tf.hash) {
                continue;
            }
            for (addr, change) in tf.changes.iter() {
                if change.is_zero() {
                    continue;
                }
                let window = windows.entry(addr).or_default();
                if change.is_sign_negative() {
                    *window.flows.sents.entry(tf.hash.clone()).or_default() += change;
                } else {
                    *window.flows.recvs.entry(tf.hash.clone()).or_default() += change;
                }
                window.tfs.push(tf);
            }
        }

        let mut events = Vec::new();
        for (addr, window) in windows {
            let sent: Decimal = window.flows.sents.values().copied().sum::<Decimal>().abs();
            let mut change: Decimal = window.flows.recvs.values().copied().sum::<Decimal>() - sent;
            let max_time = window.tfs.iter().map(|tf| tf.time_or_epoch()).max().unwrap_or(now);

            let baseline = self.baselines.get(addr);
            let mut sent_added = window.flows.sents.keys().collect::<HashSet<_>>();
            if let Some(baseline) = baseline {
                for hash in baseline.sents.keys() {
                    sent_added.remove(&hash);
                }
                // Baseline entries that already left the window are not part of `change`
                for (hash, old) in baseline.sents.iter() {
                    if window.flows.sents.contains_key(hash) {
                        change -= *old;
                    }
                }
                for (hash, old) in baseline.recvs.iter() {
                    if window.flows.recvs.contains_key(hash) {
                        change -= *old;
                    }
                }
            }

            let sent_usd = sent * price;
            let amount_usd = -change * price;

            if sent_usd >= threshold && amount_usd < threshold {
                for tf in &window.tfs {
                    self.sents_notified
                        .entry(tf.hash.clone())
                        .or_insert(SentNotice { time: max_time, kept: true });
                }
            }

            if amount_usd < threshold || sent_added.is_empty() {
                continue;
            }

            let fresh: Vec<&Transfer> = window
                .tfs
                .iter()
                .copied()
                .filter(|tf| !self.sents_notified.contains_key(&tf.hash))
                .collect();
            if fresh.is_empty() {
                continue;
            }

            let show: Vec<&Transfer> = window
                .tfs
                .iter()
                .copied()
                .filter(|tf| self.sents_notified.get(&tf.hash).map(|n| n.kept).unwrap_or(true))
                .collect();
            let show = majority(show, config.majority_volume_fraction);

            LogContext::new("tracker", "large_transfer")
                .with_address(addr)
                .with_amount(change.abs())
                .with_metadata("transfers", serde_json::json!(show.len()))
                .info("Large net outflow");
            events.push(TransferEvent::new(
                addr,
                change.abs(),
                max_time,
                show.into_iter().cloned().collect(),
            ));

            self.baselines.insert(addr.to_string(), window.flows);
            for tf in fresh {
                self.sents_notified
                    .insert(tf.hash.clone(), SentNotice { time: max_time, kept: false });
            }
        }

        let keep = memory_window(config);
        self.sents_notified.retain(|_, notice| now - notice.time <= keep);
        events
    }
}

/// The largest transfer carrying at least `fraction` of the volume, or all of
/// them when none does. Equal values go to the earliest.
fn majority(show: Vec<&Transfer>, fraction: Decimal) -> Vec<&Transfer> {
    let total: Decimal = show.iter().map(|tf| tf.value(false)).sum();
    if total.is_zero() {
        return show;
    }
    let mut best: Option<(&Transfer, Decimal)> = None;
    for tf in &show {
        let value = tf.value(false);
        if value / total < fraction {
            continue;
        }
        if best.map(|(_, v)| value > v).unwrap_or(true) {
            best = Some((*tf, value));
        }
    }
    match best {
        Some((tf, _)) => vec![tf],
        None => show,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chain;
    use chrono::Duration;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn config(threshold: &str, fraction: &str) -> TrackerConfig {
        TrackerConfig {
            recent_transfers_threshold: dec(threshold),
            majority_volume_fraction: dec(fraction),
            recent_transfers_period_seconds: 1000,
            ..TrackerConfig::default()
        }
    }

    fn prices() -> PriceBook {
        PriceBook::with_prices([("cg:idena".to_string(), Decimal::ONE)])
    }

    enum Step {
        Tx(&'static str, &'static str, &'static str, Option<(&'static str, usize)>),
        /// The previous transfer leaves the window
        Wait,
    }
    use Step::*;

    fn run_case(config: &TrackerConfig, steps: &[Step]) {
        let start = Utc::now();
        let prices = prices();
        let notified = NotifiedHashes::default();
        let mut detector = LargeTransferDetector::new();
        let mut window: Vec<Transfer> = Vec::new();

        for (i, step) in steps.iter().enumerate() {
            match step {
                Wait => {
                    window.pop();
                }
                Tx(from, to, amount, expected) => {
                    let mut tf = Transfer::new(&format!("0x{:02}", i), Chain::Idena, 100 + i as u64, 0);
                    tf.timestamp = Some(start + Duration::seconds(i as i64));
                    tf.signer = Some(from.to_string());
                    tf.changes = Transfer::create_changes(from, Some(to), dec(amount));
                    tf.tags.insert(Tag::Send);
                    window.push(tf);

                    let events = detector.check(&window, start, config, &prices, &notified);
                    match expected {
                        None => assert!(events.is_empty(), "step {} emitted {:?}", i, events),
                        Some((amount, len)) => {
                            assert_eq!(events.len(), 1, "step {}", i);
                            assert_eq!(events[0].by, *from, "step {}", i);
                            assert_eq!(events[0].amount, dec(amount), "step {}", i);
                            assert_eq!(events[0].tfs.len(), *len, "step {}", i);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_single_large_transfer() {
        let config = config("100", "1");
        run_case(&config, &[Tx("0x1", "0x2", "50", None)]);
        run_case(&config, &[Tx("0x1", "0x2", "100", Some(("100", 1)))]);
    }

    #[test]
    fn test_small_transfers_accumulate() {
        run_case(
            &config("100", "1"),
            &[
                Tx("0x1", "0x2", "50", None),
                Tx("0x1", "0x2", "55", Some(("105", 2))),
                Tx("0x1", "0x2", "50", None),
                Tx("0x1", "0x2", "50", Some(("100", 2))),
            ],
        );
    }

    #[test]
    fn test_receive_many_then_send() {
        run_case(
            &config("100", "1"),
            &[
                Tx("0x1", "0x0", "50", None),
                Tx("0x2", "0x0", "50", None),
                Tx("0x3", "0x0", "50", None),
                Tx("0x0", "0x4", "150", None),
                Tx("0x0", "0x4", "200", Some(("200", 5))),
            ],
        );
    }

    #[test]
    fn test_back_and_forth() {
        run_case(
            &config("100", "1"),
            &[
                Tx("0x1", "0x2", "100", Some(("100", 1))),
                Tx("0x2", "0x1", "100", None),
                Tx("0x1", "0x2", "100", None),
                Tx("0x2", "0x1", "100", None),
                Tx("0x1", "0x3", "200", Some(("100", 4))),
            ],
        );
    }

    #[test]
    fn test_received_funds_sent_on() {
        run_case(
            &config("100", "1"),
            &[
                Tx("0x2", "0x1", "50", None),
                Tx("0x3", "0x1", "50", None),
                Tx("0x4", "0x1", "50", None),
                Tx("0x1", "0x5", "200", None),
                Tx("0x5", "0x1", "200", None),
                Tx("0x1", "0x5", "250", Some(("100", 6))),
            ],
        );
    }

    #[test]
    fn test_transfers_leaving_the_window() {
        let config = config("100", "1");
        run_case(
            &config,
            &[
                Tx("0x1", "0x2", "50", None),
                Wait,
                Tx("0x1", "0x2", "50", None),
                Tx("0x1", "0x2", "50", Some(("100", 2))),
            ],
        );
        run_case(
            &config,
            &[
                Tx("0x1", "0x2", "50", None),
                Tx("0x1", "0x2", "75", Some(("125", 2))),
                Tx("0x1", "0x2", "50", None),
                Wait,
                Tx("0x1", "0x2", "50", None),
                Tx("0x1", "0x2", "50", Some(("100", 2))),
            ],
        );
        run_case(
            &config,
            &[
                Tx("0x1", "0x2", "500", Some(("500", 1))),
                Wait,
                Tx("0x1", "0x2", "50", None),
                Tx("0x1", "0x2", "75", Some(("125", 2))),
            ],
        );
    }

    #[test]
    fn test_circles_do_not_repeat() {
        let config = config("100", "1");
        run_case(
            &config,
            &[
                Tx("0x1", "0x2", "100", Some(("100", 1))),
                Tx("0x2", "0x1", "100", None),
                Tx("0x1", "0x2", "100", None),
            ],
        );
        run_case(
            &config,
            &[
                Tx("0x1", "0x2", "500", Some(("500", 1))),
                Tx("0x2", "0x3", "500", None),
                Tx("0x3", "0x4", "500", None),
                Tx("0x4", "0x1", "500", None),
                Tx("0x1", "0x2", "500", None),
                Tx("0x1", "0x2", "50", None),
                Tx("0x1", "0x2", "80", Some(("130", 4))),
            ],
        );
    }

    #[test]
    fn test_largest_of_several_majorities_wins() {
        let config = config("100", "0.4");
        let start = Utc::now();
        let notified = NotifiedHashes::default();
        let mut detector = LargeTransferDetector::new();

        let mut window = Vec::new();
        for (i, amount) in ["45", "15", "50"].iter().enumerate() {
            let mut tf = Transfer::new(&format!("0xm{}", i), Chain::Idena, 100 + i as u64, 0);
            tf.timestamp = Some(start + Duration::seconds(i as i64));
            tf.signer = Some("0x1".to_string());
            tf.changes = Transfer::create_changes("0x1", Some("0x2"), dec(amount));
            tf.tags.insert(Tag::Send);
            window.push(tf);
        }

        let events = detector.check(&window, start, &config, &prices(), &notified);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].amount, dec("110"));
        let shown: Vec<&str> = events[0].tfs.iter().map(|tf| tf.hash.as_str()).collect();
        assert_eq!(shown, vec!["0xm2"]);
    }

    #[test]
    fn test_equal_majorities_keep_the_earliest() {
        let config = config("100", "0.4");
        let start = Utc::now();
        let shown = |tfs: &[Transfer]| {
            let mut detector = LargeTransferDetector::new();
            let events = detector.check(tfs, start, &config, &prices(), &NotifiedHashes::default());
            events[0].tfs.iter().map(|tf| tf.hash.clone()).collect::<Vec<_>>()
        };

        let window: Vec<Transfer> = (0..2)
            .map(|i| {
                let mut tf = Transfer::new(&format!("0xe{}", i), Chain::Idena, 100 + i as u64, 0);
                tf.timestamp = Some(start + Duration::seconds(i as i64));
                tf.signer = Some("0x1".to_string());
                tf.changes = Transfer::create_changes("0x1", Some("0x2"), dec("60"));
                tf.tags.insert(Tag::Send);
                tf
            })
            .collect();
        assert_eq!(shown(&window), vec!["0xe0"]);
    }

    #[test]
    fn test_majority_transfer_shown_alone() {
        let config = config("100", "0.75");
        run_case(
            &config,
            &[
                Tx("0x1", "0x2", "50", None),
                Tx("0x1", "0x3", "20", None),
                Tx("0x1", "0x4", "55", Some(("125", 3))),
            ],
        );
        run_case(
            &config,
            &[
                Tx("0x1", "0x2", "5", None),
                Tx("0x1", "0x2", "5", None),
                Tx("0x1", "0x2", "10", None),
                Tx("0x1", "0x2", "500", Some(("520", 1))),
            ],
        );
    }

    #[test]
    fn test_notified_hashes_are_skipped() {
        let config = config("100", "1");
        let mut notified = NotifiedHashes::default();
        let mut tf = Transfer::new("0xdead", Chain::Idena, 1, 0);
        tf.timestamp = Some(Utc::now());
        tf.changes = Transfer::create_changes("0x1", Some("0x2"), dec("1000"));
        notified.insert(&tf.hash, Utc::now());

        let mut detector = LargeTransferDetector::new();
        assert!(detector.check(&[tf], Utc::now(), &config, &prices(), &notified).is_empty());
    }
}
