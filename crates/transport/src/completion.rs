//! "Spinner + Stability" completion detection.
//!
//! A reply is complete once the generation indicator is gone and neither the
//! response-block count nor the size of the last block has changed for the
//! stability window. The detector also requires evidence that a reply
//! started (the indicator was seen, or a block beyond the baseline exists),
//! so a page that never reacts runs into the deadline instead of completing
//! on the pre-send state.

use std::time::Duration;
use tokio::time::Instant;

use crate::page::ResponseStats;

#[derive(Debug)]
pub struct CompletionDetector {
    baseline: usize,
    stability: Duration,
    started: bool,
    last: Option<(usize, usize)>,
    stable_since: Option<Instant>,
}

impl CompletionDetector {
    pub fn new(baseline: usize, stability: Duration) -> Self {
        Self {
            baseline,
            stability,
            started: false,
            last: None,
            stable_since: None,
        }
    }

    /// Feed one sample. Returns true when the reply is complete.
    pub fn observe(&mut self, stats: ResponseStats, now: Instant) -> bool {
        let signature = (stats.count, stats.last_size);

        if stats.generating {
            self.started = true;
            self.last = Some(signature);
            self.stable_since = None;
            return false;
        }
        if stats.count > self.baseline {
            self.started = true;
        }

        if self.last != Some(signature) || self.stable_since.is_none() {
            self.last = Some(signature);
            self.stable_since = Some(now);
            return false;
        }

        match self.stable_since {
            Some(since) if self.started => now.duration_since(since) >= self.stability,
            _ => false,
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }
}
