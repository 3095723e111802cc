//! Default constants for entityvault configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Storage Defaults (RocksDB)
// =============================================================================

/// Default block cache size in MB
pub const DEFAULT_BLOCK_CACHE_MB: usize = 256;

/// Default write buffer size in MB
/// Larger values batch more writes before flushing to disk.
pub const DEFAULT_WRITE_BUFFER_MB: usize = 64;

/// Entity rows kept in the persistent backend's read cache
pub const DEFAULT_ENTITY_CACHE_CAPACITY: usize = 100_000;

// =============================================================================
// Partitioning Defaults
// =============================================================================

/// Partitions handed to a new entity set (`0..8`, partitions version 1)
pub const DEFAULT_PARTITION_COUNT: usize = 8;

// =============================================================================
// Batching Defaults
// =============================================================================

/// Entity keys per hard-delete or clear statement
pub const DEFAULT_DELETE_CHUNK_SIZE: usize = 10_000;

/// Upper bound on the delete chunk size regardless of configuration
pub const MAX_DELETE_CHUNK_SIZE: usize = 10_000;

/// Blob keys per Blob Store delete request
pub const DEFAULT_BLOB_DELETE_BATCH_SIZE: usize = 1_000;

/// Rows fetched per page by cursors and scans
pub const DEFAULT_READ_PAGE_SIZE: usize = 1_000;

// =============================================================================
// Linking Defaults
// =============================================================================

/// How long entity or cluster lock acquisition waits before failing
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Minimum score for the threshold clusterer to keep a match edge
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.75;

/// Extra attempts when cluster membership shifts while locks are taken
pub const DEFAULT_CLUSTER_LOOKUP_RETRIES: usize = 3;
