//! Fixed-capacity chunk history with sequence numbering and byte statistics.
//!
//! Stores the last N reads of PTY output so a reconnecting client can replay
//! scrollback without the server keeping unbounded history. Unlike a plain
//! byte ring, chunks keep their sequence stamp and timestamp, which is what
//! lets clients anchor replay (`startSeq`) and reorder live deliveries.

use crate::now_ms;

/// One read's worth of output, stamped at write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Monotonic per session, starting at 1. Never reused, even after the
    /// slot it lived in is overwritten.
    pub sequence: i64,
    pub timestamp_ms: i64,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Snapshot of buffer counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferStats {
    pub capacity: usize,
    pub used: usize,
    /// Bytes across currently retained chunks (decremented on overwrite).
    pub total_bytes: u64,
    pub writes: u64,
    pub reads: u64,
    pub oldest_timestamp_ms: Option<i64>,
    pub newest_timestamp_ms: Option<i64>,
    pub approx_memory: u64,
}

/// Fixed-capacity FIFO of chunks; the oldest chunk is overwritten when full.
#[derive(Debug)]
pub struct RingBuffer {
    slots: Vec<Option<Chunk>>,
    head: usize,
    tail: usize,
    full: bool,
    next_sequence: i64,
    total_bytes: u64,
    writes: u64,
    reads: u64,
}

impl RingBuffer {
    /// Create a buffer with room for `capacity` chunks (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
            full: false,
            next_sequence: 1,
            total_bytes: 0,
            writes: 0,
            reads: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of retained chunks.
    pub fn used(&self) -> usize {
        if self.full {
            self.slots.len()
        } else {
            (self.head + self.slots.len() - self.tail) % self.slots.len()
        }
    }

    /// Append a chunk, overwriting the oldest when full. The buffer takes
    /// ownership of `data`; callers that want to reuse a buffer must copy
    /// first. Returns the assigned sequence, or `None` for an empty slice
    /// (rejected silently).
    pub fn write(&mut self, data: Vec<u8>) -> Option<i64> {
        if data.is_empty() {
            return None;
        }
        if self.full {
            if let Some(old) = self.slots[self.tail].take() {
                self.total_bytes -= old.size() as u64;
            }
            self.tail = (self.tail + 1) % self.slots.len();
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.total_bytes += data.len() as u64;
        self.writes += 1;
        self.slots[self.head] = Some(Chunk {
            sequence,
            timestamp_ms: now_ms(),
            data,
        });
        self.head = (self.head + 1) % self.slots.len();
        self.full = self.head == self.tail;
        Some(sequence)
    }

    /// Hand out the next sequence without retaining a chunk. Keeps live
    /// numbering monotonic while output is being discarded (resize
    /// suppression) and leaves `clear` as the single reset point.
    pub fn reserve_sequence(&mut self) -> i64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    pub fn next_sequence(&self) -> i64 {
        self.next_sequence
    }

    /// All retained bytes, concatenated in chronological order.
    pub fn read_all(&mut self) -> Vec<u8> {
        self.reads += 1;
        let mut out = Vec::with_capacity(self.total_bytes as usize);
        for chunk in self.iter_chunks() {
            out.extend_from_slice(&chunk.data);
        }
        out
    }

    /// Independent copies of every retained chunk, oldest first.
    pub fn read_all_chunks(&mut self) -> Vec<Chunk> {
        self.reads += 1;
        self.iter_chunks().cloned().collect()
    }

    /// Retained chunks stamped at or after `min_timestamp_ms`. The timestamp
    /// is advisory for partial reads only; ordering is always insertion
    /// order.
    pub fn read_from(&mut self, min_timestamp_ms: i64) -> Vec<Chunk> {
        self.reads += 1;
        self.iter_chunks()
            .filter(|c| c.timestamp_ms >= min_timestamp_ms)
            .cloned()
            .collect()
    }

    /// Wipe all slots and reset counters; sequence numbering restarts at 1.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.tail = 0;
        self.full = false;
        self.next_sequence = 1;
        self.total_bytes = 0;
        self.writes = 0;
        self.reads = 0;
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            capacity: self.slots.len(),
            used: self.used(),
            total_bytes: self.total_bytes,
            writes: self.writes,
            reads: self.reads,
            oldest_timestamp_ms: self.iter_chunks().next().map(|c| c.timestamp_ms),
            newest_timestamp_ms: self.iter_chunks().last().map(|c| c.timestamp_ms),
            approx_memory: self.total_bytes
                + (self.slots.len() * std::mem::size_of::<Option<Chunk>>()) as u64,
        }
    }

    fn iter_chunks(&self) -> impl Iterator<Item = &Chunk> {
        let capacity = self.slots.len();
        let used = self.used();
        (0..used).filter_map(move |i| self.slots[(self.tail + i) % capacity].as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn datas(rb: &mut RingBuffer) -> Vec<Vec<u8>> {
        rb.read_all_chunks().into_iter().map(|c| c.data).collect()
    }

    #[test]
    fn write_then_read_in_order() {
        let mut rb = RingBuffer::new(5);
        rb.write(b"one".to_vec());
        rb.write(b"two".to_vec());
        rb.write(b"three".to_vec());
        let chunks = rb.read_all_chunks();
        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks.iter().map(|c| c.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(chunks[1].data, b"two");
        assert_eq!(rb.read_all(), b"onetwothree");
    }

    #[test]
    fn overflow_drops_oldest_and_keeps_byte_accounting() {
        let mut rb = RingBuffer::new(3);
        rb.write(b"a".to_vec());
        rb.write(b"bb".to_vec());
        rb.write(b"ccc".to_vec());
        assert_eq!(rb.stats().total_bytes, 6);

        rb.write(b"dddd".to_vec());
        assert_eq!(rb.stats().total_bytes, 9);
        assert_eq!(datas(&mut rb), vec![b"bb".to_vec(), b"ccc".to_vec(), b"dddd".to_vec()]);
    }

    #[test]
    fn sequences_survive_overwrite() {
        let mut rb = RingBuffer::new(2);
        for i in 0..5u8 {
            rb.write(vec![i]);
        }
        let seqs: Vec<i64> = rb.read_all_chunks().iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![4, 5]);
        assert_eq!(rb.next_sequence(), 6);
    }

    #[test]
    fn empty_write_is_rejected() {
        let mut rb = RingBuffer::new(2);
        assert_eq!(rb.write(Vec::new()), None);
        assert_eq!(rb.used(), 0);
        assert_eq!(rb.stats().writes, 0);
    }

    #[test]
    fn clear_resets_sequence_numbering() {
        let mut rb = RingBuffer::new(4);
        rb.write(b"x".to_vec());
        rb.write(b"y".to_vec());
        rb.clear();
        assert_eq!(rb.used(), 0);
        assert_eq!(rb.stats().total_bytes, 0);
        assert_eq!(rb.write(b"z".to_vec()), Some(1));
    }

    #[test]
    fn reserve_sequence_advances_without_retaining() {
        let mut rb = RingBuffer::new(4);
        assert_eq!(rb.write(b"a".to_vec()), Some(1));
        assert_eq!(rb.reserve_sequence(), 2);
        assert_eq!(rb.write(b"b".to_vec()), Some(3));
        assert_eq!(rb.used(), 2);
    }

    #[test]
    fn read_from_filters_by_timestamp() {
        let mut rb = RingBuffer::new(4);
        rb.write(b"old".to_vec());
        let cutoff = rb.read_all_chunks()[0].timestamp_ms + 1;
        // Forge a later chunk by writing after the cutoff computation; the
        // clock may not tick between writes, so adjust the stored stamp.
        rb.write(b"new".to_vec());
        {
            let newest = rb.slots[1].as_mut().expect("occupied slot");
            newest.timestamp_ms = cutoff;
        }
        let late = rb.read_from(cutoff);
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].data, b"new");
    }

    #[test]
    fn stats_reflect_reads_and_bounds() {
        let mut rb = RingBuffer::new(2);
        rb.write(b"aa".to_vec());
        let _ = rb.read_all();
        let _ = rb.read_all_chunks();
        let stats = rb.stats();
        assert_eq!(stats.capacity, 2);
        assert_eq!(stats.used, 1);
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.oldest_timestamp_ms, stats.newest_timestamp_ms);
        assert!(stats.approx_memory >= stats.total_bytes);
    }

    #[test]
    fn capacity_is_at_least_one() {
        let mut rb = RingBuffer::new(0);
        assert_eq!(rb.capacity(), 1);
        rb.write(b"a".to_vec());
        rb.write(b"b".to_vec());
        assert_eq!(datas(&mut rb), vec![b"b".to_vec()]);
    }

    proptest! {
        // Writing K > N distinct single-byte payloads retains exactly the
        // last N, in write order.
        #[test]
        fn overflow_keeps_last_n_in_order(capacity in 1usize..8, writes in 1usize..64) {
            let mut rb = RingBuffer::new(capacity);
            for i in 0..writes {
                rb.write(vec![i as u8]);
            }
            let kept = rb.read_all();
            let expected: Vec<u8> = (writes.saturating_sub(capacity)..writes)
                .map(|i| i as u8)
                .collect();
            prop_assert_eq!(kept, expected);
        }

        // total_bytes always equals the sum of retained chunk sizes, across
        // any interleaving of writes and clears.
        #[test]
        fn byte_accounting_holds(ops in proptest::collection::vec(
            prop_oneof![
                proptest::collection::vec(any::<u8>(), 0..16).prop_map(Op::Write),
                Just(Op::Clear),
            ],
            0..64,
        )) {
            let mut rb = RingBuffer::new(4);
            for op in ops {
                match op {
                    Op::Write(data) => { rb.write(data); }
                    Op::Clear => rb.clear(),
                }
                let retained: u64 = rb
                    .read_all_chunks()
                    .iter()
                    .map(|c| c.size() as u64)
                    .sum();
                prop_assert_eq!(rb.stats().total_bytes, retained);
            }
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(Vec<u8>),
        Clear,
    }
}
