use serde::Serialize;
use tokio::time::Instant;

/// Per-message generation timing. Consumed exactly once by [`finish`];
/// a cancelled run simply drops it.
///
/// [`finish`]: PerfAccumulator::finish
#[derive(Debug)]
pub struct PerfAccumulator {
    started: Instant,
    first_token: Option<Instant>,
    last_token: Option<Instant>,
    tokens: u64,
}

/// Immutable performance summary reported with `run-finalized`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerfSummary {
    /// Tokens received from the source.
    pub generated_tokens: u64,
    /// Prompt/context-injection overhead known to the caller.
    pub overhead_tokens: u64,
    /// `generated_tokens + overhead_tokens`.
    pub token_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_first_token_ms: Option<u64>,
    pub duration_ms: u64,
    /// Generated tokens per second between first and last token. Absent
    /// until at least one token arrived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_per_second: Option<f64>,
}

impl PerfAccumulator {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            first_token: None,
            last_token: None,
            tokens: 0,
        }
    }

    pub fn record_token(&mut self) {
        let now = Instant::now();
        self.first_token.get_or_insert(now);
        self.last_token = Some(now);
        self.tokens += 1;
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn finish(self, overhead_tokens: u64) -> PerfSummary {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        let time_to_first_token_ms = self
            .first_token
            .map(|t| t.duration_since(self.started).as_millis() as u64);
        let tokens_per_second = match (self.first_token, self.last_token) {
            (Some(first), Some(last)) if self.tokens > 0 => {
                let secs = last.duration_since(first).as_secs_f64();
                if secs > 0.0 {
                    Some(self.tokens as f64 / secs)
                } else {
                    None
                }
            }
            _ => None,
        };
        PerfSummary {
            generated_tokens: self.tokens,
            overhead_tokens,
            token_count: self.tokens + overhead_tokens,
            time_to_first_token_ms,
            duration_ms,
            tokens_per_second,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn summary_includes_overhead_and_timing() {
        let mut perf = PerfAccumulator::start();
        tokio::time::advance(Duration::from_millis(100)).await;
        perf.record_token();
        tokio::time::advance(Duration::from_millis(500)).await;
        perf.record_token();
        let summary = perf.finish(40);
        assert_eq!(summary.generated_tokens, 2);
        assert_eq!(summary.token_count, 42);
        assert_eq!(summary.time_to_first_token_ms, Some(100));
        assert_eq!(summary.duration_ms, 600);
        assert_eq!(summary.tokens_per_second, Some(4.0));
    }

    #[tokio::test(start_paused = true)]
    async fn no_tokens_means_no_throughput() {
        let perf = PerfAccumulator::start();
        let summary = perf.finish(0);
        assert_eq!(summary.generated_tokens, 0);
        assert!(summary.time_to_first_token_ms.is_none());
        assert!(summary.tokens_per_second.is_none());
    }
}
