//! Message Batcher.
//!
//! One logical accumulator per target (connection or subscription), each
//! with its own deadline. Batching never reorders messages within a single
//! target queue — envelopes are appended in arrival order and flushed as one
//! wire frame (an array of envelopes). Strategy selection and thresholds are
//! plain configuration, not compiled-in constants.

use crate::config::BatchConfig;
use crate::envelope::Envelope;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStrategy {
    TimeBased,
    SizeBased,
    Hybrid,
    Adaptive,
}

impl Default for BatchStrategy {
    fn default() -> Self {
        BatchStrategy::Hybrid
    }
}

struct TargetAccumulator {
    envelopes: Vec<Envelope>,
    bytes: usize,
    opened_at: Instant,
    forced_flush: bool,
    recent_depths: Vec<usize>,
}

impl TargetAccumulator {
    fn new() -> Self {
        Self {
            envelopes: Vec::new(),
            bytes: 0,
            opened_at: Instant::now(),
            forced_flush: false,
            recent_depths: Vec::new(),
        }
    }
}

/// Accumulates envelopes per target and decides when to flush them as a
/// single wire frame.
pub struct MessageBatcher {
    config: BatchConfig,
    strategy: BatchStrategy,
    targets: Mutex<HashMap<String, TargetAccumulator>>,
}

impl MessageBatcher {
    pub fn new(config: BatchConfig, strategy: BatchStrategy) -> Self {
        Self {
            config,
            strategy,
            targets: Mutex::new(HashMap::new()),
        }
    }

    /// Append `envelope` to `target`'s accumulator. Returns `true` if this
    /// enqueue forces an immediate flush (critical or high-priority).
    pub async fn push(&self, target: &str, envelope: Envelope) -> bool {
        let forces_flush = envelope.critical_kind || envelope.priority >= self.config.priority_threshold;
        let mut targets = self.targets.lock().await;
        let acc = targets.entry(target.to_string()).or_insert_with(TargetAccumulator::new);
        acc.bytes += envelope.size_bytes;
        acc.envelopes.push(envelope);
        if forces_flush {
            acc.forced_flush = true;
        }
        forces_flush
    }

    /// Whether `target`'s accumulator should flush right now, per the
    /// configured strategy.
    pub async fn should_flush(&self, target: &str) -> bool {
        let targets = self.targets.lock().await;
        let Some(acc) = targets.get(target) else { return false };
        if acc.envelopes.is_empty() {
            return false;
        }
        if acc.forced_flush {
            return true;
        }

        let max_size = self.adaptive_max_size(acc);
        let elapsed = acc.opened_at.elapsed();

        match self.strategy {
            BatchStrategy::TimeBased => elapsed >= Duration::from_millis(self.config.max_wait_ms),
            BatchStrategy::SizeBased => acc.envelopes.len() >= max_size || acc.bytes >= self.config.max_batch_bytes,
            BatchStrategy::Hybrid | BatchStrategy::Adaptive => {
                elapsed >= Duration::from_millis(self.config.max_wait_ms)
                    || acc.envelopes.len() >= max_size
                    || acc.bytes >= self.config.max_batch_bytes
            }
        }
    }

    /// `max_batch_size`, adjusted within `[adaptive_min, adaptive_max]` as a
    /// function of recent average queue depth.
    /// Strategies other than `Adaptive` just return the configured fixed
    /// size.
    fn adaptive_max_size(&self, acc: &TargetAccumulator) -> usize {
        if self.strategy != BatchStrategy::Adaptive || acc.recent_depths.is_empty() {
            return self.config.max_batch_size;
        }
        let avg = acc.recent_depths.iter().sum::<usize>() / acc.recent_depths.len();
        avg.clamp(self.config.adaptive_min, self.config.adaptive_max)
    }

    /// Drain and return `target`'s accumulated envelopes as one frame,
    /// resetting the accumulator for the next window.
    pub async fn flush(&self, target: &str) -> Vec<Envelope> {
        let mut targets = self.targets.lock().await;
        let Some(acc) = targets.get_mut(target) else { return Vec::new() };

        let depth = acc.envelopes.len();
        let drained = std::mem::take(&mut acc.envelopes);
        acc.bytes = 0;
        acc.opened_at = Instant::now();
        acc.forced_flush = false;
        acc.recent_depths.push(depth);
        if acc.recent_depths.len() > 20 {
            acc.recent_depths.remove(0);
        }
        drained
    }

    /// Targets with a non-empty accumulator, for the batcher's sweep loop to
    /// check against `should_flush`.
    pub async fn active_targets(&self) -> Vec<String> {
        self.targets
            .lock()
            .await
            .iter()
            .filter(|(_, acc)| !acc.envelopes.is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }
}
