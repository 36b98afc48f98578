//! Segment pipeline: track requested and received segment numbers, pick the
//! next ones to request within the outstanding-request window.

use std::collections::{BTreeMap, BTreeSet};

use crate::fetcher::RequestToken;

/// Per-object segment bookkeeping.
#[derive(Debug, Default)]
pub struct SegmentWindow {
    in_flight: BTreeMap<u64, RequestToken>,
    received: BTreeSet<u64>,
    final_segment: Option<u64>,
}

/// A final block id that contradicts what was already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalBlockConflict {
    pub final_segment: u64,
    pub seen: u64,
}

impl SegmentWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn final_segment(&self) -> Option<u64> {
        self.final_segment
    }

    #[cfg(test)]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_received(&self, segment: u64) -> bool {
        self.received.contains(&segment)
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    pub fn highest_received(&self) -> Option<u64> {
        self.received.iter().next_back().copied()
    }

    /// Lowest segment numbers neither received nor in flight, so that at most
    /// `window` requests are outstanding. Bounded by the final segment once known.
    pub fn next_to_request(&self, window: usize) -> Vec<u64> {
        let budget = window.max(1).saturating_sub(self.in_flight.len());
        let mut out = Vec::with_capacity(budget);
        let mut candidate = 0u64;
        while out.len() < budget {
            if let Some(last) = self.final_segment {
                if candidate > last {
                    break;
                }
            }
            if !self.received.contains(&candidate) && !self.in_flight.contains_key(&candidate) {
                out.push(candidate);
            }
            candidate = match candidate.checked_add(1) {
                Some(c) => c,
                None => break,
            };
        }
        out
    }

    pub fn mark_requested(&mut self, segment: u64, token: RequestToken) {
        self.in_flight.insert(segment, token);
    }

    /// Record arrival. Returns the token that was in flight for it, if any.
    pub fn mark_received(&mut self, segment: u64) -> Option<RequestToken> {
        self.received.insert(segment);
        self.in_flight.remove(&segment)
    }

    /// Segment content went missing before assembly; request it again.
    pub fn forget_received(&mut self, segment: u64) -> bool {
        self.received.remove(&segment)
    }

    /// Forget an in-flight request (failed or cancelled) so it can be re-requested.
    pub fn forget_request(&mut self, segment: u64) -> Option<RequestToken> {
        self.in_flight.remove(&segment)
    }

    pub fn segment_for_token(&self, token: RequestToken) -> Option<u64> {
        self.in_flight
            .iter()
            .find(|(_, t)| **t == token)
            .map(|(s, _)| *s)
    }

    /// Accept a final block id. Conflicts when a segment beyond it was already
    /// received, or when a different final block id was accepted earlier.
    pub fn set_final(&mut self, final_segment: u64) -> Result<(), FinalBlockConflict> {
        if let Some(existing) = self.final_segment {
            if existing != final_segment {
                return Err(FinalBlockConflict {
                    final_segment,
                    seen: existing.max(self.highest_received().unwrap_or(0)),
                });
            }
            return Ok(());
        }
        if let Some(highest) = self.highest_received() {
            if highest > final_segment {
                return Err(FinalBlockConflict {
                    final_segment,
                    seen: highest,
                });
            }
        }
        self.final_segment = Some(final_segment);
        Ok(())
    }

    /// In-flight requests for segments past the final one; the caller cancels them.
    pub fn take_beyond_final(&mut self) -> Vec<(u64, RequestToken)> {
        let Some(last) = self.final_segment else {
            return Vec::new();
        };
        let beyond: Vec<(u64, RequestToken)> = self
            .in_flight
            .range(last.saturating_add(1)..)
            .map(|(s, t)| (*s, *t))
            .collect();
        for (s, _) in &beyond {
            self.in_flight.remove(s);
        }
        beyond
    }

    pub fn in_flight_tokens(&self) -> Vec<RequestToken> {
        self.in_flight.values().copied().collect()
    }

    pub fn clear_in_flight(&mut self) {
        self.in_flight.clear();
    }

    /// All segments 0..=final received.
    pub fn is_complete(&self) -> bool {
        match self.final_segment {
            Some(last) => (0..=last).all(|s| self.received.contains(&s)),
            None => false,
        }
    }
}
