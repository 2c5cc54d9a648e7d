//! Live tick admission
//!
//! Feeds deliver duplicates and slightly out-of-order updates. [`TickGuard`]
//! classifies each tick before it reaches the aggregators: duplicates are
//! dropped, late ticks within the staleness tolerance only touch the forming
//! candle, anything older is discarded.

use std::collections::{HashSet, VecDeque};
use types::{Tick, TickFingerprint, TimestampMs};

/// Fingerprints remembered for duplicate detection
const RECENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDisposition {
    /// At or after the newest processed timestamp
    Fresh,
    /// Behind the newest tick but within tolerance
    Late,
    /// Seen before
    Duplicate,
    /// Behind the newest tick beyond tolerance
    Stale,
}

#[derive(Debug, Clone)]
pub struct TickGuard {
    staleness_tolerance_ms: u64,
    latest: Option<TimestampMs>,
    order: VecDeque<TickFingerprint>,
    seen: HashSet<TickFingerprint>,
}

impl TickGuard {
    pub fn new(staleness_tolerance_ms: u64) -> Self {
        Self {
            staleness_tolerance_ms,
            latest: None,
            order: VecDeque::with_capacity(RECENT_CAPACITY),
            seen: HashSet::with_capacity(RECENT_CAPACITY),
        }
    }

    pub fn latest(&self) -> Option<TimestampMs> {
        self.latest
    }

    /// Classify and remember a tick
    pub fn admit(&mut self, tick: &Tick) -> TickDisposition {
        let fingerprint = tick.fingerprint();
        if self.seen.contains(&fingerprint) {
            return TickDisposition::Duplicate;
        }

        let disposition = match self.latest {
            Some(latest) if tick.timestamp < latest => {
                if latest - tick.timestamp <= self.staleness_tolerance_ms {
                    TickDisposition::Late
                } else {
                    return TickDisposition::Stale;
                }
            }
            _ => {
                self.latest = Some(tick.timestamp);
                TickDisposition::Fresh
            }
        };

        self.remember(fingerprint);
        disposition
    }

    fn remember(&mut self, fingerprint: TickFingerprint) {
        if self.order.len() == RECENT_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(fingerprint);
        self.seen.insert(fingerprint);
    }
}
