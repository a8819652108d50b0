use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Minimum grow step for `records.log`.
    pub data_grow_increment: u64,
    /// Minimum grow step for `graph.bin`.
    pub graph_grow_increment: u64,
    /// Sleep between weight-worker passes when nothing is pending.
    pub worker_poll: Duration,
    /// Passes after which the worker stops re-searching an unresolved hole.
    pub hole_retry_limit: u32,
    /// Floor between metadata WAL checkpoints.
    pub checkpoint_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_grow_increment: 4 * 1024 * 1024,
            graph_grow_increment: 1024 * 1024,
            worker_poll: Duration::from_millis(100),
            hole_retry_limit: 16,
            checkpoint_interval: Duration::from_secs(3600),
        }
    }
}

impl Config {
    /// Small increments and a fast worker for tests.
    pub fn small() -> Self {
        Self {
            data_grow_increment: 64 * 1024,
            graph_grow_increment: 64 * 1024,
            worker_poll: Duration::from_millis(2),
            ..Self::default()
        }
    }
}
