use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use super::frame::{FrameFlags, sequence_greater_than};

const ACK_BITS: u32 = 32;

#[derive(Debug, Clone)]
pub struct PendingFrame {
    pub sequence: u32,
    pub flags: FrameFlags,
    pub payload: Vec<u8>,
    pub last_sent: Instant,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("reliable send window full ({0} frames unacknowledged)")]
pub struct WindowFull(pub usize);

/// Outgoing half of the reliable-ordered channel: numbers frames, keeps them
/// until acknowledged and hands back the ones due for retransmission.
#[derive(Debug)]
pub struct ReliableSender {
    next_sequence: u32,
    pending: VecDeque<PendingFrame>,
    max_pending: usize,
    srtt: f32,
    rtt_var: f32,
    retransmissions: u64,
}

impl ReliableSender {
    pub fn new(max_pending: usize) -> Self {
        Self {
            next_sequence: 1,
            pending: VecDeque::with_capacity(max_pending.min(1024)),
            max_pending,
            srtt: 100.0,
            rtt_var: 50.0,
            retransmissions: 0,
        }
    }

    pub fn push(&mut self, flags: FrameFlags, payload: Vec<u8>) -> Result<u32, WindowFull> {
        if self.pending.len() >= self.max_pending {
            return Err(WindowFull(self.pending.len()));
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        if self.next_sequence == 0 {
            self.next_sequence = 1;
        }

        self.pending.push_back(PendingFrame {
            sequence,
            flags: flags | FrameFlags::RELIABLE,
            payload,
            last_sent: Instant::now(),
            attempts: 1,
        });

        Ok(sequence)
    }

    pub fn process_ack(&mut self, ack: u32, ack_bits: u32) -> usize {
        let now = Instant::now();
        let mut rtt_samples = Vec::new();
        let before = self.pending.len();

        self.pending.retain(|pending| {
            if !is_acked(pending.sequence, ack, ack_bits) {
                return true;
            }
            // Karn: only frames sent once give an unambiguous sample
            if pending.attempts == 1 {
                rtt_samples.push(now.duration_since(pending.last_sent).as_secs_f32() * 1000.0);
            }
            false
        });

        for rtt in rtt_samples {
            self.update_rtt(rtt);
        }

        before - self.pending.len()
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    pub fn resend_timeout(&self, min: Duration) -> Duration {
        Duration::from_secs_f32((self.srtt * 2.0) / 1000.0).max(min)
    }

    pub fn take_due(&mut self, now: Instant, timeout: Duration) -> Vec<PendingFrame> {
        let mut due = Vec::new();
        for pending in &mut self.pending {
            if now.duration_since(pending.last_sent) >= timeout {
                pending.last_sent = now;
                pending.attempts += 1;
                due.push(pending.clone());
            }
        }
        self.retransmissions += due.len() as u64;
        due
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    pub fn unacked_count(&self) -> usize {
        self.pending.len()
    }

    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }
}

fn is_acked(sequence: u32, ack: u32, ack_bits: u32) -> bool {
    if !sequence_greater_than(sequence, ack) {
        return true;
    }
    let diff = sequence.wrapping_sub(ack);
    diff >= 2 && diff - 2 < ACK_BITS && (ack_bits & (1 << (diff - 2))) != 0
}

/// Incoming half of the reliable-ordered channel.
#[derive(Debug)]
pub struct ReliableReceiver {
    next_expected: u32,
    buffered: BTreeMap<u32, (FrameFlags, Vec<u8>)>,
    window: u32,
}

impl ReliableReceiver {
    pub fn new(window: u32) -> Self {
        Self {
            next_expected: 1,
            buffered: BTreeMap::new(),
            window: window.max(1),
        }
    }

    /// Returns every frame that became deliverable, in sequence order.
    pub fn accept(
        &mut self,
        sequence: u32,
        flags: FrameFlags,
        payload: &[u8],
    ) -> Vec<(FrameFlags, Vec<u8>)> {
        let offset = sequence.wrapping_sub(self.next_expected);
        if offset >= self.window {
            return Vec::new();
        }

        if offset > 0 {
            self.buffered
                .entry(sequence)
                .or_insert_with(|| (flags, payload.to_vec()));
            return Vec::new();
        }

        let mut delivered = vec![(flags, payload.to_vec())];
        self.advance();
        while let Some(frame) = self.buffered.remove(&self.next_expected) {
            delivered.push(frame);
            self.advance();
        }
        delivered
    }

    fn advance(&mut self) {
        self.next_expected = self.next_expected.wrapping_add(1);
        if self.next_expected == 0 {
            self.next_expected = 1;
        }
    }

    pub fn ack_data(&self) -> (u32, u32) {
        let ack = self.next_expected.wrapping_sub(1);
        let mut bits = 0u32;
        for i in 0..ACK_BITS {
            let sequence = self.next_expected.wrapping_add(1 + i);
            if self.buffered.contains_key(&sequence) {
                bits |= 1 << i;
            }
        }
        (ack, bits)
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered.len()
    }
}

/// Sequencing for the unreliable channel: stale or duplicate frames are dropped.
#[derive(Debug, Default)]
pub struct UnreliableSequencer {
    next_outgoing: u32,
    last_incoming: Option<u32>,
}

impl UnreliableSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> u32 {
        self.next_outgoing = self.next_outgoing.wrapping_add(1);
        if self.next_outgoing == 0 {
            self.next_outgoing = 1;
        }
        self.next_outgoing
    }

    pub fn accept(&mut self, sequence: u32) -> bool {
        match self.last_incoming {
            Some(last) if !sequence_greater_than(sequence, last) => false,
            _ => {
                self.last_incoming = Some(sequence);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payloads(frames: Vec<(FrameFlags, Vec<u8>)>) -> Vec<Vec<u8>> {
        frames.into_iter().map(|(_, payload)| payload).collect()
    }

    #[test]
    fn test_in_order_delivery() {
        let mut receiver = ReliableReceiver::new(64);
        assert_eq!(payloads(receiver.accept(1, FrameFlags::RELIABLE, &[1])), vec![vec![1]]);
        assert_eq!(payloads(receiver.accept(2, FrameFlags::RELIABLE, &[2])), vec![vec![2]]);
        assert_eq!(receiver.ack_data(), (2, 0));
    }

    #[test]
    fn test_out_of_order_is_buffered() {
        let mut receiver = ReliableReceiver::new(64);

        assert!(receiver.accept(3, FrameFlags::RELIABLE, &[3]).is_empty());
        assert!(receiver.accept(2, FrameFlags::RELIABLE, &[2]).is_empty());
        assert_eq!(receiver.buffered_count(), 2);

        let (ack, bits) = receiver.ack_data();
        assert_eq!(ack, 0);
        assert_eq!(bits, 0b11);

        let delivered = payloads(receiver.accept(1, FrameFlags::RELIABLE, &[1]));
        assert_eq!(delivered, vec![vec![1], vec![2], vec![3]]);
        assert_eq!(receiver.ack_data(), (3, 0));
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut receiver = ReliableReceiver::new(64);
        assert_eq!(receiver.accept(1, FrameFlags::RELIABLE, &[1]).len(), 1);
        assert!(receiver.accept(1, FrameFlags::RELIABLE, &[1]).is_empty());

        assert!(receiver.accept(3, FrameFlags::RELIABLE, &[3]).is_empty());
        assert!(receiver.accept(3, FrameFlags::RELIABLE, &[3]).is_empty());
        assert_eq!(receiver.accept(2, FrameFlags::RELIABLE, &[2]).len(), 2);
    }

    #[test]
    fn test_beyond_window_dropped() {
        let mut receiver = ReliableReceiver::new(4);
        assert!(receiver.accept(10, FrameFlags::RELIABLE, &[0]).is_empty());
        assert_eq!(receiver.buffered_count(), 0);
    }

    #[test]
    fn test_sender_cumulative_and_selective_ack() {
        let mut sender = ReliableSender::new(16);
        for i in 0..5u8 {
            sender.push(FrameFlags::empty(), vec![i]).unwrap();
        }
        assert_eq!(sender.unacked_count(), 5);

        // 1 and 2 delivered, 4 buffered (bit 0 => ack + 2)
        assert_eq!(sender.process_ack(2, 0b1), 3);
        assert_eq!(sender.unacked_count(), 2);

        assert_eq!(sender.process_ack(5, 0), 2);
        assert_eq!(sender.unacked_count(), 0);
    }

    #[test]
    fn test_sender_window_full() {
        let mut sender = ReliableSender::new(2);
        sender.push(FrameFlags::empty(), vec![]).unwrap();
        sender.push(FrameFlags::empty(), vec![]).unwrap();
        assert_eq!(sender.push(FrameFlags::empty(), vec![]), Err(WindowFull(2)));
    }

    #[test]
    fn test_take_due_retransmits() {
        let mut sender = ReliableSender::new(16);
        sender.push(FrameFlags::ASSIGN, vec![1, 2]).unwrap();

        let now = Instant::now();
        assert!(sender.take_due(now, Duration::from_secs(60)).is_empty());

        let later = now + Duration::from_millis(500);
        let due = sender.take_due(later, Duration::from_millis(100));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].sequence, 1);
        assert!(due[0].flags.contains(FrameFlags::RELIABLE | FrameFlags::ASSIGN));
        assert_eq!(due[0].attempts, 2);
        assert_eq!(sender.retransmissions(), 1);
    }

    #[test]
    fn test_rtt_updates_on_ack() {
        let mut sender = ReliableSender::new(16);
        sender.push(FrameFlags::empty(), vec![]).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        sender.process_ack(1, 0);
        assert!(sender.srtt() > 0.0);
        assert!(sender.resend_timeout(Duration::from_millis(20)) >= Duration::from_millis(20));
    }

    #[test]
    fn test_unreliable_drops_stale() {
        let mut sequencer = UnreliableSequencer::new();
        assert!(sequencer.accept(5));
        assert!(!sequencer.accept(5));
        assert!(!sequencer.accept(3));
        assert!(sequencer.accept(6));

        let mut outgoing = UnreliableSequencer::new();
        assert_eq!(outgoing.next(), 1);
        assert_eq!(outgoing.next(), 2);
    }
}
