//! Packet rate pacing
//!
//! Token bucket measured in clock cycles. One token is earned every
//! `cycles_per_packet` cycles; the bucket holds at most one burst.

/// Token bucket limiting how many packets a worker pulls
#[derive(Debug, Clone)]
pub struct RatePacer {
    cycles_per_packet: u64,
    max_tokens: u64,
    tokens: u64,
    last: u64,
}

impl RatePacer {
    /// Pace to `rate_pps` on a clock running at `cycles_per_second`
    pub fn new(rate_pps: u64, cycles_per_second: u64, burst: usize, now: u64) -> Self {
        let max_tokens = burst.max(1) as u64;
        Self {
            cycles_per_packet: (cycles_per_second / rate_pps.max(1)).max(1),
            max_tokens,
            tokens: max_tokens,
            last: now,
        }
    }

    /// Cycles between two tokens
    pub fn cycles_per_packet(&self) -> u64 {
        self.cycles_per_packet
    }

    /// Packets that may be pulled at `now`, at most `want`
    #[inline]
    pub fn allowance(&mut self, now: u64, want: usize) -> usize {
        let earned = now.saturating_sub(self.last) / self.cycles_per_packet;
        if earned > 0 {
            self.tokens = (self.tokens + earned).min(self.max_tokens);
            self.last += earned * self.cycles_per_packet;
        }
        if self.tokens == self.max_tokens {
            // a full bucket does not bank idle time
            self.last = self.last.max(now);
        }
        want.min(self.tokens as usize)
    }

    /// Spend tokens for packets actually pulled
    #[inline]
    pub fn consume(&mut self, packets: usize) {
        self.tokens = self.tokens.saturating_sub(packets as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_with_one_burst() {
        let mut pacer = RatePacer::new(1_000, 1_000_000, 32, 0);
        assert_eq!(pacer.cycles_per_packet(), 1_000);
        assert_eq!(pacer.allowance(0, 64), 32);
        pacer.consume(32);
        assert_eq!(pacer.allowance(0, 64), 0);
    }

    #[test]
    fn test_refills_at_rate() {
        let mut pacer = RatePacer::new(1_000, 1_000_000, 32, 0);
        pacer.consume(32);
        assert_eq!(pacer.allowance(4_999, 32), 4);
        pacer.consume(4);
        assert_eq!(pacer.allowance(5_000, 32), 1);
    }

    #[test]
    fn test_idle_time_not_banked() {
        let mut pacer = RatePacer::new(1_000, 1_000_000, 8, 0);
        assert_eq!(pacer.allowance(1_000_000, 100), 8);
        pacer.consume(8);
        assert_eq!(pacer.allowance(1_000_000, 100), 0);
        assert_eq!(pacer.allowance(1_001_000, 100), 1);
    }
}
