//! Address ranking.
//!
//! The candidate set for a peer is the union of
//!
//! 1. one synthesized `<identifier>.<publicKey>` per known identifier,
//! 2. the live candidate address from the directory,
//! 3. every address in the persisted record,
//!
//! deduplicated in that order. Candidates are then stably sorted by
//! ascending RTT (unknown sorts last) and, within equal RTT, by the most
//! recent acknowledgement first. Ties beyond that keep insertion order, so
//! the result is fully deterministic.

use std::cmp::Ordering;

use crate::address::{Address, PeerKey};
use crate::book::AddressBook;
use crate::directory::PeerDirectory;
use crate::metric::{AddressMetric, MetricPool};

/// Ranking inputs for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rank {
    pub rtt_ms: Option<u64>,
    pub last_ack: u64,
}

impl Rank {
    fn of(metric: Option<&AddressMetric>) -> Self {
        metric.map_or(
            Self {
                rtt_ms: None,
                last_ack: 0,
            },
            |m| Self {
                rtt_ms: m.rtt_ms,
                last_ack: m.last_ack,
            },
        )
    }
}

/// Ordering used by [`best_addresses`].
pub fn compare_rank(a: &Rank, b: &Rank) -> Ordering {
    let rtt = match (a.rtt_ms, b.rtt_ms) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    rtt.then_with(|| b.last_ack.cmp(&a.last_ack))
}

/// Ranked candidate addresses for `key`, best first.
pub fn best_addresses(
    key: &PeerKey,
    book: &AddressBook,
    directory: &PeerDirectory,
    metrics: &MetricPool,
) -> Vec<String> {
    let record = book.get(key);
    let mut candidates: Vec<String> = Vec::new();
    let mut push = |addr: String| {
        if !candidates.contains(&addr) {
            candidates.push(addr);
        }
    };

    if let Some(record) = record {
        for id in &record.ids {
            push(Address::new(id.clone(), *key).to_string());
        }
    }
    if let Some(addr) = directory.get(key).and_then(|p| p.candidate_addr.clone()) {
        push(addr);
    }
    if let Some(record) = record {
        for m in &record.addresses {
            push(m.addr.clone());
        }
    }

    let mut ranked: Vec<(String, Rank)> = candidates
        .into_iter()
        .map(|addr| {
            let persisted = record.and_then(|r| r.addresses.iter().find(|m| m.addr == addr));
            let rank = Rank::of(metrics.get(&addr).or(persisted));
            (addr, rank)
        })
        .collect();
    ranked.sort_by(|a, b| compare_rank(&a.1, &b.1));
    ranked.into_iter().map(|(addr, _)| addr).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(b: u8) -> PeerKey {
        PeerKey([b; 32])
    }

    #[test]
    fn rtt_ascending_unknown_last() {
        let peer = key(1);
        let mut book = AddressBook::new(key(0), 800);
        let rec = book.upsert(peer).unwrap();
        let a = format!("a.{}", peer);
        let b = format!("b.{}", peer);
        let c = format!("c.{}", peer);
        rec.note_address(&a);
        rec.note_address(&b);
        rec.note_address(&c);

        let mut metrics = MetricPool::new();
        metrics.record_ack(&a, 90, 10);
        metrics.record_ack(&c, 20, 10);

        let ranked = best_addresses(&peer, &book, &PeerDirectory::new(), &metrics);
        assert_eq!(ranked, vec![c, a, b]);
    }

    #[test]
    fn equal_rtt_prefers_recent_ack() {
        let peer = key(1);
        let mut book = AddressBook::new(key(0), 800);
        let rec = book.upsert(peer).unwrap();
        let a = format!("a.{}", peer);
        let b = format!("b.{}", peer);
        rec.note_address(&a);
        rec.note_address(&b);

        let mut metrics = MetricPool::new();
        metrics.record_ack(&a, 50, 100);
        metrics.record_ack(&b, 50, 300);

        let ranked = best_addresses(&peer, &book, &PeerDirectory::new(), &metrics);
        assert_eq!(ranked, vec![b, a]);
    }

    #[test]
    fn union_of_sources_deduplicated() {
        let peer = key(2);
        let mut book = AddressBook::new(key(0), 800);
        let rec = book.upsert(peer).unwrap();
        rec.ids.insert("pose".into());
        rec.note_address(&format!("pose.{}", peer));

        let mut dir = PeerDirectory::new();
        dir.touch(peer, Some(&format!("live.{}", peer)), 10);

        let ranked = best_addresses(&peer, &book, &dir, &MetricPool::new());
        assert_eq!(ranked, vec![format!("pose.{}", peer), format!("live.{}", peer)]);
    }

    #[test]
    fn unknown_peer_has_no_candidates() {
        let book = AddressBook::new(key(0), 800);
        assert!(best_addresses(&key(9), &book, &PeerDirectory::new(), &MetricPool::new()).is_empty());
    }

    proptest! {
        #[test]
        fn ranking_is_sorted(samples in proptest::collection::vec((proptest::option::of(0u64..500), 0u64..1_000), 1..12)) {
            let peer = key(3);
            let mut book = AddressBook::new(key(0), 800);
            let mut metrics = MetricPool::new();
            let rec = book.upsert(peer).unwrap();
            for (i, (rtt, ack)) in samples.iter().enumerate() {
                let addr = format!("id{}.{}", i, peer);
                rec.note_address(&addr);
                let m = metrics.entry(&addr);
                m.rtt_ms = *rtt;
                m.last_ack = *ack;
            }

            let ranked = best_addresses(&peer, &book, &PeerDirectory::new(), &metrics);
            prop_assert_eq!(ranked.len(), samples.len());
            for pair in ranked.windows(2) {
                let a = Rank::of(metrics.get(&pair[0]));
                let b = Rank::of(metrics.get(&pair[1]));
                prop_assert_ne!(compare_rank(&a, &b), Ordering::Greater);
            }
        }
    }
}
