//! Retransmit ring buffer for sent RTP packets (C3).

/// Fixed-capacity ring of the most recently sent RTP packets, indexed by
/// `seqnum mod CAPACITY`, so a retransmit request can resend the
/// already-framed bytes without re-deriving anything (encryption is
/// deterministic on seqnum, see [`super::codec`]).
pub struct PacketRing {
    slots: Vec<Option<RingEntry>>,
}

struct RingEntry {
    sequence: u16,
    data: Vec<u8>,
}

impl PacketRing {
    /// Ring capacity: the last 1000 packets are retransmittable.
    pub const CAPACITY: usize = 1000;

    /// Create an empty ring.
    #[must_use]
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(Self::CAPACITY);
        slots.resize_with(Self::CAPACITY, || None);
        Self { slots }
    }

    fn index(sequence: u16) -> usize {
        usize::from(sequence) % Self::CAPACITY
    }

    /// Commit a fully framed (post-encryption) packet to the ring.
    pub fn insert(&mut self, sequence: u16, wire_bytes: Vec<u8>) {
        let idx = Self::index(sequence);
        self.slots[idx] = Some(RingEntry {
            sequence,
            data: wire_bytes,
        });
    }

    /// Look up a packet by sequence number. Returns `None` if the slot is
    /// empty or holds a different, wrapped-around sequence number.
    #[must_use]
    pub fn get(&self, sequence: u16) -> Option<&[u8]> {
        let idx = Self::index(sequence);
        self.slots[idx]
            .as_ref()
            .filter(|entry| entry.sequence == sequence)
            .map(|entry| entry.data.as_slice())
    }

    /// Resolve a retransmit range `(seq_start, seq_start+1, ..., seq_start+count-1 mod 2^16)`
    /// into whichever of those packets are still present, in order.
    pub fn get_range(&self, seq_start: u16, count: u16) -> impl Iterator<Item = (u16, &[u8])> + '_ {
        (0..count).filter_map(move |i| {
            let seq = seq_start.wrapping_add(i);
            self.get(seq).map(|data| (seq, data))
        })
    }
}

impl Default for PacketRing {
    fn default() -> Self {
        Self::new()
    }
}
