//! Execution engine constants.

/// Bounds the row processor's work queue. Hitting this is a bug in
/// the graph (a routing cycle that escaped structural validation), not a
/// recoverable runtime condition.
pub const MAX_WORK_QUEUE_ITERATIONS: usize = 10_000;

/// Capacity of the coalesce executor's completed-keys FIFO used to detect
/// late arrivals. Eviction means an extremely late arrival for a
/// very old row is treated as a new pending join instead of being flagged
/// — a deliberate bounded-memory trade-off.
pub const COALESCE_COMPLETED_FIFO_CAP: usize = 10_000;
