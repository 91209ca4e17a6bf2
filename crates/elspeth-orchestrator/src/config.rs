//! Pipelining configuration: the knobs that trade single-row-at-a-time
//! determinism for worker-pool throughput without giving up strict
//! source-order release.

use std::time::Duration;

use elspeth_core::ConfigurationError;

/// Controls how aggressively the orchestrator overlaps row processing.
/// `max_rows_in_flight = 1` degenerates to fully sequential processing
/// (one row pulled, processed and released before the next is pulled) —
/// the configuration every other mode is checked against for
/// bit-identical output.
#[derive(Debug, Clone)]
pub struct PipeliningConfig {
    /// Upper bound on rows dispatched to the `WorkPool` before having
    /// been released. Enforced by `RowSlots`, a Mutex+Condvar counting
    /// semaphore the `SourcePuller` blocks on before pulling the next row.
    pub max_rows_in_flight: usize,
    /// Upper bound on completed-but-not-yet-released outcomes sitting in
    /// the channel feeding the `ReleaseQueue`. Realized as that channel's
    /// own bounded capacity — a full channel blocks the sender, which is
    /// exactly the "blocks worker submissions when the queue is
    /// oversaturated" backpressure this bound describes.
    pub max_completed_waiting: usize,
    /// Number of `WorkPool` worker threads. Independent of
    /// `max_rows_in_flight`, though a pool bigger than the rows-in-flight
    /// bound can never have every thread busy at once.
    pub pool_size: usize,
    /// Rows released between durability checkpoints.
    pub checkpoint_frequency: usize,
    /// True when every sink in the graph is known to serialize its own
    /// writes (e.g. a single append-only file or a single DB connection)
    /// and pipelining would buy nothing but contention.
    pub single_writer_store: bool,
    /// True when the graph has at least one aggregation node. Aggregation
    /// buffers grow with `max_rows_in_flight`, so a large bound trades
    /// memory for throughput more directly than in an aggregation-free
    /// pipeline.
    pub has_aggregations: bool,
    /// How long a coalesce join may sit short of its policy's
    /// requirement before `check_timeout` resolves it on a live arrival.
    /// The end-of-source sweep does not use this value — it always
    /// forces an immediate resolution, since there will be no further
    /// arrivals to wait for.
    pub coalesce_timeout: Duration,
}

impl PipeliningConfig {
    /// Fully sequential: one row in flight, one worker, no headroom in
    /// the completed-waiting bound beyond what a single row needs.
    pub fn single_threaded() -> Self {
        Self {
            max_rows_in_flight: 1,
            max_completed_waiting: 1,
            pool_size: 1,
            checkpoint_frequency: 100,
            single_writer_store: false,
            has_aggregations: false,
            coalesce_timeout: Duration::from_secs(30),
        }
    }
}

/// Validates a `PipeliningConfig` against the rules spelled out for it:
/// `max_completed_waiting` must be able to hold at least as many
/// outcomes as rows can be in flight, or every worker would eventually
/// block trying to submit a result no one can drain. The rest are
/// advisory warnings, not hard failures.
pub fn validate_pipelining_config(config: &PipeliningConfig) -> Result<Vec<String>, ConfigurationError> {
    let mut issues = Vec::new();
    if config.max_completed_waiting < config.max_rows_in_flight {
        issues.push((
            "pipelining.max_completed_waiting".to_string(),
            format!(
                "max_completed_waiting ({}) is smaller than max_rows_in_flight ({}); every row in flight must be able to land in the completed queue",
                config.max_completed_waiting, config.max_rows_in_flight
            ),
        ));
    }
    if config.max_rows_in_flight == 0 {
        issues.push(("pipelining.max_rows_in_flight".to_string(), "must be at least 1".to_string()));
    }
    if config.pool_size == 0 {
        issues.push(("pipelining.pool_size".to_string(), "must be at least 1".to_string()));
    }
    if !issues.is_empty() {
        return Err(ConfigurationError {
            issues: issues
                .into_iter()
                .map(|(location, message)| elspeth_core::ConfigIssue::new(location, message))
                .collect(),
        });
    }

    let mut warnings = Vec::new();
    if config.single_writer_store && config.max_rows_in_flight > 1 {
        warnings.push(
            "pipelining with a single-writer-store sink gains no write concurrency, only contention on that sink"
                .to_string(),
        );
    }
    if config.has_aggregations && config.max_rows_in_flight > 5 {
        warnings.push(format!(
            "max_rows_in_flight = {} with aggregations present means up to that many rows' worth of buffer can be in an open batch at once",
            config.max_rows_in_flight
        ));
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_completed_waiting_smaller_than_rows_in_flight() {
        let config = PipeliningConfig {
            max_completed_waiting: 2,
            ..PipeliningConfig::single_threaded().with_rows_in_flight(4)
        };
        assert!(validate_pipelining_config(&config).is_err());
    }

    #[test]
    fn single_threaded_config_is_clean() {
        let warnings = validate_pipelining_config(&PipeliningConfig::single_threaded()).unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn warns_on_single_writer_store_with_pipelining() {
        let mut config = PipeliningConfig::single_threaded().with_rows_in_flight(4);
        config.max_completed_waiting = 4;
        config.single_writer_store = true;
        let warnings = validate_pipelining_config(&config).unwrap();
        assert!(warnings.iter().any(|w| w.contains("single-writer-store")));
    }

    impl PipeliningConfig {
        fn with_rows_in_flight(mut self, n: usize) -> Self {
            self.max_rows_in_flight = n;
            self
        }
    }
}
