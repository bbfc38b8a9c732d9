//! Transmit buffering
//!
//! Packets headed for one output are collected here and sent as a burst.
//! Whatever the output refuses is handled by the configured
//! [`BackpressurePolicy`].

use crate::buffer::Mbuf;
use crate::config::BackpressurePolicy;
use crate::port::BurstPort;
use crate::ring::Ring;
use std::sync::Arc;

/// Something a burst can be handed to
pub trait TxTarget {
    /// Take packets from the front of `pkts`, returning how many were taken
    fn transmit(&mut self, pkts: &mut Vec<Mbuf>) -> usize;
}

impl TxTarget for Box<dyn BurstPort> {
    #[inline]
    fn transmit(&mut self, pkts: &mut Vec<Mbuf>) -> usize {
        self.tx_burst(pkts)
    }
}

impl TxTarget for Arc<Ring<Mbuf>> {
    #[inline]
    fn transmit(&mut self, pkts: &mut Vec<Mbuf>) -> usize {
        self.enqueue_bulk(pkts)
    }
}

/// Result of one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Packets the target accepted
    pub sent: usize,
    /// Bytes the target accepted
    pub sent_bytes: u64,
    /// Packets freed because of backpressure
    pub dropped: usize,
    /// Whether the target refused part of the burst
    pub rejected: bool,
}

impl FlushOutcome {
    pub fn merge(&mut self, other: FlushOutcome) {
        self.sent += other.sent;
        self.sent_bytes += other.sent_bytes;
        self.dropped += other.dropped;
        self.rejected |= other.rejected;
    }
}

/// Per-output accumulation buffer
#[derive(Debug)]
pub struct TxBuffer {
    pending: Vec<Mbuf>,
    threshold: usize,
    policy: BackpressurePolicy,
    attempts: u32,
    dropped: u64,
}

impl TxBuffer {
    /// Flush automatically once `threshold` packets are pending
    pub fn new(threshold: usize, policy: BackpressurePolicy) -> Self {
        let threshold = threshold.max(1);
        Self {
            pending: Vec::with_capacity(threshold * 2),
            threshold,
            policy,
            attempts: 0,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Packets dropped over the buffer's lifetime
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Queue one packet, sending to `target` when the threshold is reached
    ///
    /// Refused packets stay pending; the backpressure policy is only
    /// applied by [`flush`](Self::flush), once per poll cycle.
    #[inline]
    pub fn buffer(&mut self, pkt: Mbuf, target: &mut dyn TxTarget) -> FlushOutcome {
        self.pending.push(pkt);
        if self.pending.len() < self.threshold {
            return FlushOutcome::default();
        }
        let outcome = self.try_flush(target);
        if self.pending.is_empty() {
            self.attempts = 0;
        }
        outcome
    }

    /// Send what is pending and apply the backpressure policy to the rest
    ///
    /// Each call that leaves packets behind spends one `Retry` attempt.
    pub fn flush(&mut self, target: &mut dyn TxTarget) -> FlushOutcome {
        let mut outcome = self.try_flush(target);
        if self.pending.is_empty() {
            self.attempts = 0;
            return outcome;
        }

        let give_up = match self.policy {
            BackpressurePolicy::Drop => true,
            BackpressurePolicy::Retry { max_attempts } => {
                self.attempts = self.attempts.saturating_add(1);
                self.attempts > max_attempts
            }
        };
        if give_up {
            outcome.dropped = self.drop_pending();
        }
        outcome
    }

    /// Send what is pending; refused packets stay pending
    pub fn try_flush(&mut self, target: &mut dyn TxTarget) -> FlushOutcome {
        if self.pending.is_empty() {
            return FlushOutcome::default();
        }
        let before = pending_bytes(&self.pending);
        let sent = target.transmit(&mut self.pending);
        FlushOutcome {
            sent,
            sent_bytes: before - pending_bytes(&self.pending),
            dropped: 0,
            rejected: !self.pending.is_empty(),
        }
    }

    /// Release everything pending as if it had been sent
    pub fn discard(&mut self) -> FlushOutcome {
        let outcome = FlushOutcome {
            sent: self.pending.len(),
            sent_bytes: pending_bytes(&self.pending),
            ..Default::default()
        };
        self.pending.clear();
        self.attempts = 0;
        outcome
    }

    /// Free everything pending, counting it as dropped
    pub fn drop_pending(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        self.attempts = 0;
        self.dropped += n as u64;
        n
    }
}

fn pending_bytes(pkts: &[Mbuf]) -> u64 {
    pkts.iter().map(|p| p.len() as u64).sum()
}
