//! Order-book reconstruction.
//!
//! Every venue client feeds its wire messages through the same side-update
//! rule: remove the level at the incoming price, insert it back when the
//! quantity is positive, re-sort, truncate to the venue's depth limit.
//! Snapshots replace a side wholesale. Updates are applied to a copy and
//! committed only if the result is uncrossed, so a rejected update leaves
//! the book exactly as it was.

use crate::types::{now_ms, OrderBook, PriceLevel};
use tracing::warn;

/// Normalized content of one wire message, diff or snapshot.
#[derive(Debug, Clone, Default)]
pub struct BookUpdate {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    /// Snapshot messages replace both sides instead of patching them.
    pub is_snapshot: bool,
    /// Exchange event time in UTC ms; wall-clock when the venue omits it.
    pub timestamp_ms: Option<i64>,
    /// Final update id for venues with monotonic sequences (Binance `u`,
    /// Bybit `u`, KuCoin `sequenceEnd`).
    pub final_seq: Option<u64>,
}

impl BookUpdate {
    pub fn snapshot(bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> Self {
        Self {
            bids,
            asks,
            is_snapshot: true,
            ..Default::default()
        }
    }

    pub fn diff(bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> Self {
        Self {
            bids,
            asks,
            is_snapshot: false,
            ..Default::default()
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.final_seq = Some(seq);
        self
    }

    pub fn with_timestamp(mut self, ts_ms: i64) -> Self {
        self.timestamp_ms = Some(ts_ms);
        self
    }
}

/// What happened to the book when an update was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Final id not newer than the book's current id; book unchanged.
    StaleSeq,
    /// Book would stay crossed even after recomputing both sides; unchanged.
    RejectedCrossed,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SideOrder {
    BidsDescending,
    AsksAscending,
}

fn sort_side(levels: &mut Vec<PriceLevel>, order: SideOrder, depth: usize) {
    levels.retain(|l| l.quantity_f64() > 0.0);
    match order {
        SideOrder::BidsDescending => levels.sort_by(|a, b| {
            b.price_f64()
                .partial_cmp(&a.price_f64())
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
        SideOrder::AsksAscending => levels.sort_by(|a, b| {
            a.price_f64()
                .partial_cmp(&b.price_f64())
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
    }
    levels.dedup_by(|a, b| a.price_f64() == b.price_f64());
    levels.truncate(depth);
}

fn patch_side(levels: &mut Vec<PriceLevel>, updates: &[PriceLevel], order: SideOrder, depth: usize) {
    for update in updates {
        let price = update.price_f64();
        levels.retain(|l| l.price_f64() != price);
        if update.quantity_f64() > 0.0 {
            levels.push(update.clone());
        }
    }
    sort_side(levels, order, depth);
}

fn is_crossed(book: &OrderBook) -> bool {
    match (book.best_bid(), book.best_ask()) {
        (Some(bid), Some(ask)) => bid.price_f64() >= ask.price_f64(),
        _ => false,
    }
}

impl OrderBook {
    /// Apply one normalized wire message. Commits only uncrossed results.
    pub fn apply(&mut self, update: BookUpdate) -> ApplyOutcome {
        if let (Some(final_seq), Some(current)) = (update.final_seq, self.seq_id) {
            if final_seq <= current {
                return ApplyOutcome::StaleSeq;
            }
        }

        let depth = self.venue.depth_limit();
        let mut next = self.clone();

        if update.is_snapshot {
            next.bids = update.bids;
            next.asks = update.asks;
            sort_side(&mut next.bids, SideOrder::BidsDescending, depth);
            sort_side(&mut next.asks, SideOrder::AsksAscending, depth);
        } else {
            patch_side(&mut next.bids, &update.bids, SideOrder::BidsDescending, depth);
            patch_side(&mut next.asks, &update.asks, SideOrder::AsksAscending, depth);
        }

        if is_crossed(&next) {
            // A transient cross can be a sorting artifact; recompute both
            // sides from the stored entries before giving up.
            sort_side(&mut next.bids, SideOrder::BidsDescending, depth);
            sort_side(&mut next.asks, SideOrder::AsksAscending, depth);
            if is_crossed(&next) {
                warn!(
                    venue = %self.venue,
                    symbol = %self.symbol,
                    "rejecting update that leaves book crossed"
                );
                return ApplyOutcome::RejectedCrossed;
            }
        }

        next.timestamp_ms = update.timestamp_ms.unwrap_or_else(now_ms);
        if update.final_seq.is_some() {
            next.seq_id = update.final_seq;
        }

        *self = next;
        ApplyOutcome::Applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VenueId;

    fn level(price: &str, qty: &str) -> PriceLevel {
        PriceLevel::new(price, qty)
    }

    fn seeded_book() -> OrderBook {
        let mut book = OrderBook::new(VenueId::Binance, "BTCUSDT");
        let snap = BookUpdate::snapshot(
            vec![level("100", "1"), level("99", "2"), level("98", "3")],
            vec![level("101", "1"), level("102", "2"), level("103", "3")],
        );
        assert_eq!(book.apply(snap), ApplyOutcome::Applied);
        book
    }

    #[test]
    fn test_snapshot_sorts_and_strips_zero_quantities() {
        let mut book = OrderBook::new(VenueId::Binance, "BTCUSDT");
        let snap = BookUpdate::snapshot(
            vec![level("99", "2"), level("100", "1"), level("98", "0")],
            vec![level("103", "3"), level("101", "1"), level("102", "0")],
        );
        assert_eq!(book.apply(snap), ApplyOutcome::Applied);
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.bids[0].price, "100");
        assert_eq!(book.bids[1].price, "99");
        assert_eq!(book.asks.len(), 2);
        assert_eq!(book.asks[0].price, "101");
        assert_eq!(book.asks[1].price, "103");
    }

    #[test]
    fn test_diff_removes_and_inserts_levels() {
        let mut book = seeded_book();
        let diff = BookUpdate::diff(
            vec![level("99", "0"), level("100.5", "4")],
            vec![level("101", "0.7")],
        );
        assert_eq!(book.apply(diff), ApplyOutcome::Applied);
        assert_eq!(book.bids[0].price, "100.5");
        assert!(book.bids.iter().all(|l| l.price != "99"));
        assert_eq!(book.asks[0].quantity, "0.7");
    }

    #[test]
    fn test_diff_is_idempotent() {
        let mut once = seeded_book();
        let diff = BookUpdate::diff(vec![level("99.5", "5")], vec![level("102", "0")]);
        once.apply(diff.clone());
        let mut twice = seeded_book();
        twice.apply(diff.clone());
        twice.apply(diff);
        assert_eq!(once.bids, twice.bids);
        assert_eq!(once.asks, twice.asks);
    }

    #[test]
    fn test_snapshot_replaces_wholesale() {
        let mut book = seeded_book();
        let snap = BookUpdate::snapshot(vec![level("50", "1")], vec![level("51", "1")]);
        book.apply(snap);
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.asks.len(), 1);
        assert_eq!(book.bids[0].price, "50");
    }

    #[test]
    fn test_stale_seq_is_skipped() {
        let mut book = seeded_book();
        book.seq_id = Some(100);
        let before = book.clone();

        let stale = BookUpdate::diff(vec![level("100", "9")], vec![]).with_seq(100);
        assert_eq!(book.apply(stale), ApplyOutcome::StaleSeq);
        assert_eq!(book.bids, before.bids);
        assert_eq!(book.seq_id, Some(100));

        let fresh = BookUpdate::diff(vec![level("100", "9")], vec![]).with_seq(101);
        assert_eq!(book.apply(fresh), ApplyOutcome::Applied);
        assert_eq!(book.seq_id, Some(101));
        assert_eq!(book.bids[0].quantity, "9");
    }

    #[test]
    fn test_crossed_snapshot_is_rejected() {
        let mut book = seeded_book();
        let before = book.clone();
        // bids=[100,99], asks=[98,101]: best bid 100 >= best ask 98 and a
        // resort cannot uncross it
        let crossed = BookUpdate::snapshot(
            vec![level("100", "1"), level("99", "1")],
            vec![level("98", "1"), level("101", "1")],
        );
        assert_eq!(book.apply(crossed), ApplyOutcome::RejectedCrossed);
        assert_eq!(book.bids, before.bids);
        assert_eq!(book.asks, before.asks);
        assert_eq!(book.timestamp_ms, before.timestamp_ms);
    }

    #[test]
    fn test_truncates_to_venue_depth() {
        let mut book = OrderBook::new(VenueId::Coinbase, "BTC-USD");
        let bids: Vec<PriceLevel> = (0..80)
            .map(|i| level(&format!("{}", 1000 - i), "1"))
            .collect();
        let snap = BookUpdate::snapshot(bids, vec![level("2000", "1")]);
        book.apply(snap);
        assert_eq!(book.bids.len(), VenueId::Coinbase.depth_limit());
        assert_eq!(book.bids[0].price, "1000");
    }

    #[test]
    fn test_duplicate_prices_deduplicated() {
        let mut book = OrderBook::new(VenueId::Kraken, "XBT/USD");
        let snap = BookUpdate::snapshot(
            vec![level("100.0", "1"), level("100.0", "2"), level("99", "1")],
            vec![level("101", "1")],
        );
        book.apply(snap);
        assert_eq!(book.bids.len(), 2);
    }

    #[test]
    fn test_update_timestamp_defaults_to_wall_clock() {
        let mut book = seeded_book();
        let stamped = BookUpdate::diff(vec![level("99", "1")], vec![]).with_timestamp(123_456);
        book.apply(stamped);
        assert_eq!(book.timestamp_ms, 123_456);

        let before = now_ms();
        book.apply(BookUpdate::diff(vec![level("98.5", "1")], vec![]));
        assert!(book.timestamp_ms >= before);
    }

    #[test]
    fn test_removing_unknown_price_is_noop() {
        let mut book = seeded_book();
        let before = book.clone();
        let diff = BookUpdate::diff(vec![level("42", "0")], vec![]);
        assert_eq!(book.apply(diff), ApplyOutcome::Applied);
        assert_eq!(book.bids, before.bids);
    }
}
