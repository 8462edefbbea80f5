//! Default configuration values
//!
//! Used by the `Default` impls in `node_config` and by tests that need the
//! stock tuning without loading a file.

/// Node defaults
pub mod node {
    pub const HOST: &str = "0.0.0.0";
    pub const PORT: u16 = 8000;
    pub const SUBPATH: &str = "/api/v1/actor";
    pub const CONCURRENCY: usize = 100;

    /// Prefix of the loopback network every node joins for itself
    pub const LOCAL_NETWORK: &str = "localhost";

    /// Timeout of one ask round trip (seconds)
    pub const ASK_TIMEOUT_SECS: u64 = 30;

    /// Largest accepted request body (bytes)
    pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

    /// Prefix of environment overrides, e.g. `ACTOR__PORT=9000`
    pub const ENV_PREFIX: &str = "ACTOR";
}

/// Mailbox defaults
pub mod queue {
    /// Below this many inbox messages a fetch is scheduled
    pub const INBOX_LOWSIZE: usize = 10;

    /// A fetch asks for at most `INBOX_HIGHSIZE - inbox_size` messages
    pub const INBOX_HIGHSIZE: usize = 30;

    pub const OUTBOX_LOWSIZE: usize = 100;

    /// An actor whose outbox reaches this size is not scheduled
    pub const OUTBOX_HIGHSIZE: usize = 300;

    /// Base delay before an exported message is retried (seconds)
    pub const CYCLE_TIME_SECS: f64 = 600.0;

    pub const MAX_RETRY_COUNT: u32 = 3;

    /// Cap of the retry backoff (seconds)
    pub const MAX_RETRY_TIME_SECS: f64 = 600.0;

    /// Upstream nodes sampled per fetch round
    pub const FETCHER_CONCURRENCY: usize = 3;

    /// Capacity of the recently completed ring
    pub const MAX_COMPLETE_SIZE: usize = 128;
}

/// Write-ahead log defaults
pub mod storage {
    /// No compaction below this many records
    pub const COMPACT_MIN_RECORDS: u64 = 1_000;

    /// Compact when the log is this many times the live state
    pub const COMPACT_RATIO: u64 = 3;

    /// Compact when the log exceeds the live state by this many records
    pub const COMPACT_MAX_DELTA: u64 = 100_000;
}
