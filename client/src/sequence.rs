//! Client-side reorder buffer.
//!
//! WebSocket reconnection edges can deliver chunks out of order. This buffer
//! releases them in sequence order, holding early arrivals until the gap
//! fills — but it deliberately trades completeness for liveness: once a gap
//! has stalled for `max_stall_ms`, the missing chunk is skipped rather than
//! freezing the terminal. A far-ahead arrival (or a full buffer) resets the
//! expectation outright, which is also how a server-side history clear
//! (sequence numbers restarting at 1) recovers.

use std::collections::BTreeMap;

use floeterm_core::Chunk;

#[derive(Debug, Clone)]
pub struct ReorderConfig {
    /// Chunks held while waiting for a gap to fill.
    pub max_pending_chunks: usize,
    /// How far ahead of the expected sequence a chunk may be and still be
    /// buffered.
    pub max_sequence_gap: i64,
    /// Pending size at which everything is force-dropped.
    pub force_cleanup_threshold: usize,
    /// Interval between sweeps that evict out-of-window pending entries.
    pub cleanup_interval_ms: i64,
    /// How long the oldest pending chunk may wait before the gap is skipped.
    pub max_stall_ms: i64,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            max_pending_chunks: 40,
            max_sequence_gap: 32,
            force_cleanup_threshold: 60,
            cleanup_interval_ms: 5_000,
            max_stall_ms: 500,
        }
    }
}

pub struct SequenceBuffer {
    config: ReorderConfig,
    /// Next sequence to release.
    expected: i64,
    /// Early arrivals, keyed by sequence, with their first arrival time.
    pending: BTreeMap<i64, (Chunk, i64)>,
    last_cleanup_ms: i64,
}

impl SequenceBuffer {
    pub fn new(config: ReorderConfig) -> Self {
        Self {
            config,
            expected: 1,
            pending: BTreeMap::new(),
            last_cleanup_ms: 0,
        }
    }

    pub fn expected(&self) -> i64 {
        self.expected
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed one chunk; returns everything releasable, in order.
    pub fn push(&mut self, chunk: Chunk, now_ms: i64) -> Vec<Chunk> {
        let mut released = Vec::new();

        // Non-sequenced data bypasses ordering entirely.
        if chunk.sequence < 1 {
            released.push(chunk);
            return released;
        }

        self.flush_stalled(now_ms, &mut released);

        if chunk.sequence == self.expected {
            self.expected += 1;
            released.push(chunk);
            self.drain_contiguous(&mut released);
        } else if chunk.sequence > self.expected
            && chunk.sequence <= self.expected + self.config.max_sequence_gap
            && self.pending.len() < self.config.max_pending_chunks
        {
            // First arrival wins; a duplicate keeps the original stamp.
            self.pending
                .entry(chunk.sequence)
                .or_insert((chunk, now_ms));
        } else {
            // Far ahead, stale, or out of room: jump rather than stall.
            self.expected = chunk.sequence + 1;
            self.pending.clear();
            released.push(chunk);
        }

        self.maybe_cleanup(now_ms);
        released
    }

    /// Clear all state; the next expected sequence becomes
    /// `max(1, start_sequence)`.
    pub fn reset(&mut self, start_sequence: i64) {
        self.pending.clear();
        self.expected = start_sequence.max(1);
    }

    fn flush_stalled(&mut self, now_ms: i64, released: &mut Vec<Chunk>) {
        let Some((&oldest_seq, &(_, inserted_at))) = self.pending.iter().next() else {
            return;
        };
        if now_ms - inserted_at >= self.config.max_stall_ms {
            self.expected = oldest_seq;
            self.drain_contiguous(released);
        }
    }

    fn drain_contiguous(&mut self, released: &mut Vec<Chunk>) {
        while let Some((chunk, _)) = self.pending.remove(&self.expected) {
            released.push(chunk);
            self.expected += 1;
        }
    }

    fn maybe_cleanup(&mut self, now_ms: i64) {
        if self.pending.len() >= self.config.force_cleanup_threshold {
            self.pending.clear();
            return;
        }
        if now_ms - self.last_cleanup_ms < self.config.cleanup_interval_ms {
            return;
        }
        self.last_cleanup_ms = now_ms;
        let lo = self.expected;
        let hi = self.expected + self.config.max_sequence_gap;
        self.pending.retain(|&seq, _| seq >= lo && seq <= hi);
    }
}

impl Default for SequenceBuffer {
    fn default() -> Self {
        Self::new(ReorderConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chunk(seq: i64) -> Chunk {
        Chunk {
            sequence: seq,
            timestamp_ms: 0,
            data: vec![seq as u8],
        }
    }

    fn seqs(chunks: &[Chunk]) -> Vec<i64> {
        chunks.iter().map(|c| c.sequence).collect()
    }

    #[test]
    fn in_order_passthrough() {
        let mut buf = SequenceBuffer::default();
        for seq in 1..=5 {
            assert_eq!(seqs(&buf.push(chunk(seq), 0)), vec![seq]);
        }
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn out_of_order_release_waits_for_gap() {
        let mut buf = SequenceBuffer::default();
        assert!(buf.push(chunk(2), 0).is_empty());
        assert!(buf.push(chunk(3), 0).is_empty());
        assert_eq!(seqs(&buf.push(chunk(1), 0)), vec![1, 2, 3]);
    }

    #[test]
    fn non_sequenced_chunks_bypass_ordering() {
        let mut buf = SequenceBuffer::default();
        assert!(buf.push(chunk(2), 0).is_empty());
        assert_eq!(seqs(&buf.push(chunk(0), 0)), vec![0]);
        assert_eq!(seqs(&buf.push(chunk(-5), 0)), vec![-5]);
        assert_eq!(buf.pending_len(), 1);
    }

    #[test]
    fn stall_break_releases_pending_before_new_chunk() {
        let mut buf = SequenceBuffer::default();
        assert!(buf.push(chunk(2), 0).is_empty());
        assert!(buf.push(chunk(3), 0).is_empty());
        // Nothing arrives until past the stall deadline; the next push
        // releases the stalled run first.
        let released = buf.push(chunk(4), 600);
        assert_eq!(seqs(&released), vec![2, 3, 4]);
    }

    #[test]
    fn far_ahead_jump_discards_pending() {
        let mut buf = SequenceBuffer::default();
        assert!(buf.push(chunk(2), 0).is_empty());
        let released = buf.push(chunk(100), 0);
        assert_eq!(seqs(&released), vec![100]);
        assert_eq!(buf.expected(), 101);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn stale_sequence_jumps_instead_of_stalling() {
        let mut buf = SequenceBuffer::default();
        for seq in 1..=10 {
            buf.push(chunk(seq), 0);
        }
        // The server cleared its history and restarted numbering.
        let released = buf.push(chunk(1), 0);
        assert_eq!(seqs(&released), vec![1]);
        assert_eq!(buf.expected(), 2);
    }

    #[test]
    fn pending_capacity_forces_jump() {
        let mut buf = SequenceBuffer::new(ReorderConfig {
            max_pending_chunks: 2,
            ..ReorderConfig::default()
        });
        assert!(buf.push(chunk(2), 0).is_empty());
        assert!(buf.push(chunk(3), 0).is_empty());
        // Buffer is full; the next out-of-order chunk triggers the jump.
        let released = buf.push(chunk(4), 0);
        assert_eq!(seqs(&released), vec![4]);
        assert_eq!(buf.expected(), 5);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn force_cleanup_threshold_drops_everything() {
        let mut buf = SequenceBuffer::new(ReorderConfig {
            max_pending_chunks: 10,
            max_sequence_gap: 100,
            force_cleanup_threshold: 3,
            ..ReorderConfig::default()
        });
        buf.push(chunk(3), 0);
        buf.push(chunk(5), 0);
        buf.push(chunk(7), 0);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn pending_entries_stay_within_the_reorder_window() {
        let mut buf = SequenceBuffer::new(ReorderConfig {
            max_sequence_gap: 4,
            ..ReorderConfig::default()
        });
        buf.push(chunk(3), 0);
        // A far-ahead jump discards the old pending set entirely.
        let released = buf.push(chunk(50), 100);
        assert_eq!(seqs(&released), vec![50]);
        assert_eq!(buf.pending_len(), 0);
        // Entries buffered after the jump sit inside the new window, and the
        // periodic sweep (past cleanup_interval) leaves them alone.
        buf.push(chunk(52), 6_000);
        assert_eq!(buf.pending_len(), 1);
        assert!(buf
            .pending
            .keys()
            .all(|&s| s >= buf.expected && s <= buf.expected + buf.config.max_sequence_gap));
    }

    #[test]
    fn reset_clears_state() {
        let mut buf = SequenceBuffer::default();
        buf.push(chunk(5), 0);
        buf.reset(10);
        assert_eq!(buf.expected(), 10);
        assert_eq!(buf.pending_len(), 0);
        buf.reset(-3);
        assert_eq!(buf.expected(), 1);
    }

    proptest! {
        // Any permutation of 1..=n (n within the reorder window) comes out
        // as exactly 1..=n, in order.
        #[test]
        fn permutations_release_in_order(
            perm in (1usize..=33)
                .prop_flat_map(|n| Just((1..=n as i64).collect::<Vec<_>>()).prop_shuffle())
        ) {
            let n = perm.len() as i64;
            let mut buf = SequenceBuffer::default();
            buf.reset(1);
            let mut out = Vec::new();
            for seq in perm {
                out.extend(seqs(&buf.push(chunk(seq), 0)));
            }
            let expected: Vec<i64> = (1..=n).collect();
            prop_assert_eq!(out, expected);
        }
    }
}
